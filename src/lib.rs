//! Plugin Runtime - admission, sandboxing and hot reload for host extensions

pub mod audit;
pub mod config;
pub mod error;
pub mod hooks;
pub mod plugins;
pub mod reload;
pub mod security;
pub mod utils;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use plugins::PluginManager;
