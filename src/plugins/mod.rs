//! Plugin system
//!
//! This module admits third-party plugin files into the host, tracks their
//! versions and dependencies, and drives their lifecycle. Each plugin is a
//! single script file whose metadata sits in a leading comment block or in a
//! sidecar JSON manifest with the same stem.
//!
//! # Architecture
//!
//! - **version**: semantic versions and constraint expressions
//! - **types**: core data structures (`PluginMetadata`, `PluginConfig`, `Plugin`)
//! - **loader**: plugin discovery, file checks and metadata parsing
//! - **registry**: loaded plugins with their config and data
//! - **resolver**: dependency graph with conflict and cycle detection
//! - **manager**: the orchestrator the host talks to
//!
//! # Plugin Directory Structure
//!
//! ```text
//! ~/.plugin-runtime/plugins/
//! ├── auto-backup.lua
//! ├── auto-backup.json     (optional manifest, wins over the header)
//! └── stats-panel.lua
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use plugin_runtime::hooks::NoopEngineFactory;
//! use plugin_runtime::plugins::PluginManager;
//! use plugin_runtime::RuntimeConfig;
//!
//! # async fn run() -> plugin_runtime::error::Result<()> {
//! let manager = PluginManager::new(RuntimeConfig::load()?, Arc::new(NoopEngineFactory))?;
//! let report = manager.load_all().await?;
//! println!("Loaded {} plugins", report.loaded.len());
//! # Ok(())
//! # }
//! ```

pub mod loader;
pub mod manager;
pub mod registry;
pub mod resolver;
pub mod types;
pub mod version;

pub use loader::{manifest_path, parse_metadata_header, LoadedPlugin, PluginLoader};
pub use manager::{HookDispatch, LoadReport, ManagerStats, PluginManager};
pub use registry::{PluginRegistry, RegistryEntry};
pub use resolver::{ConflictInfo, ConflictType, DependencyResolver, DependencySpec};
pub use types::{
    permissions, ExecutionRecord, ExecutionStatus, Plugin, PluginConfig, PluginMetadata,
};
pub use version::{Version, VersionConstraint};
