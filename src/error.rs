//! Error types for the plugin runtime
//!
//! This module defines the error taxonomy shared by every component: admission
//! errors raised while loading a plugin, dependency conflicts, sandbox denials,
//! reload failures and execution faults. Uses `thiserror` for ergonomic error
//! handling with automatic `Display` and `Error` trait implementations.

use std::time::Duration;

use thiserror::Error;

use crate::plugins::resolver::ConflictInfo;
use crate::security::signature::SignatureError;

/// The primary error type for plugin runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration-related errors (invalid config values, unreadable config file, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Manifest or metadata problems (missing required fields, unknown hooks, etc.)
    #[error("Invalid plugin metadata: {0}")]
    InvalidMetadata(String),

    /// A version string could not be parsed.
    #[error("Invalid version '{input}': {reason}")]
    InvalidVersion { input: String, reason: String },

    /// A version constraint expression could not be parsed.
    #[error("Invalid version constraint '{input}': {reason}")]
    InvalidConstraint { input: String, reason: String },

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin already loaded: {0}")]
    PluginAlreadyLoaded(String),

    #[error("Maximum number of plugins exceeded (limit {0})")]
    MaxPluginsExceeded(usize),

    #[error("Plugin is disabled: {0}")]
    PluginDisabled(String),

    /// The plugin's declared host compatibility range excludes this host.
    #[error("Plugin '{plugin}' is not compatible with host version {host}: {reason}")]
    Incompatible {
        plugin: String,
        host: String,
        reason: String,
    },

    /// Signature absent, revoked, expired, tampered or untrusted.
    #[error("Signature verification failed for plugin '{plugin}': {source}")]
    Signature {
        plugin: String,
        #[source]
        source: SignatureError,
    },

    /// Missing dependency, version mismatch or circular dependency.
    #[error(transparent)]
    Dependency(#[from] ConflictInfo),

    /// Sandbox denied a permission at a call site that treats denial as fatal.
    #[error("Permission denied for plugin '{plugin}': {reason}")]
    PermissionDenied { plugin: String, reason: String },

    #[error("Invalid sandbox policy: {0}")]
    InvalidPolicy(String),

    /// The execution deadline fired before the plugin returned.
    #[error("Plugin '{plugin}' execution timed out after {timeout:?}")]
    ExecutionTimeout { plugin: String, timeout: Duration },

    /// The plugin body itself reported an error.
    #[error("Plugin '{plugin}' execution failed: {message}")]
    Execution { plugin: String, message: String },

    #[error("Hook '{hook}' failed for plugin '{plugin}': {message}")]
    Hook {
        plugin: String,
        hook: String,
        message: String,
    },

    /// The freshly loaded code was rejected (ID change, permission escalation).
    #[error("Reload validation failed for plugin '{plugin}': {reason}")]
    ReloadValidation { plugin: String, reason: String },

    /// Reload failed, the previous instance was restored.
    #[error("Reload of plugin '{plugin}' failed and was rolled back: {reason}")]
    ReloadFailed { plugin: String, reason: String },

    /// Reload failed and restoring the previous instance failed as well.
    #[error("Reload of plugin '{plugin}' failed ({reload}); rollback also failed ({rollback})")]
    RollbackFailed {
        plugin: String,
        reload: String,
        rollback: String,
    },

    /// Filesystem watcher errors.
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// Key generation, signing or PEM encoding failures.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<notify::Error> for RuntimeError {
    fn from(err: notify::Error) -> Self {
        RuntimeError::Watcher(err.to_string())
    }
}

/// A specialized `Result` type for plugin runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
