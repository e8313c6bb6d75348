//! Security layer: sandbox policies and code signatures.

pub mod sandbox;
pub mod signature;

pub use sandbox::{
    IsolationLevel, SandboxManager, SandboxPolicy, SecurityViolation, Severity, Verdict,
    ViolationStats, ViolationType,
};
pub use signature::{
    EventStatus, PluginSignature, SecurityEvent, SecurityStats, SignatureError, SignatureVerifier,
};
