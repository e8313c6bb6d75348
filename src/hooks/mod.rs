//! Lifecycle hooks and the plugin execution seam.
//!
//! Plugins react to host events through a fixed set of hooks:
//!
//! - `load` / `unload`: lifecycle, always delivered
//! - `save:open` / `save:save`: a save file was opened or written
//! - `character:edit`: a character record is being edited
//! - `ui:render` / `menu:add`: host UI extension points
//! - `sync`: periodic synchronisation tick
//!
//! The runtime never interprets plugin code itself. Each loaded plugin is
//! backed by a [`PluginEngine`] created by an [`EngineFactory`]; the scripting
//! collaborator implements both. [`NoopEngineFactory`] is the default and makes
//! every hook and execution succeed immediately.
//!
//! # Example
//!
//! ```rust
//! use plugin_runtime::hooks::{Hook, HookType};
//!
//! let hook = Hook::SaveOpen { path: "slot1.sav".into() };
//! assert_eq!(hook.hook_type(), HookType::SaveOpen);
//! assert_eq!(hook.hook_type().as_str(), "save:open");
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::plugins::types::PluginMetadata;

// ---------------------------------------------------------------------------
// Hook kinds
// ---------------------------------------------------------------------------

/// Name of a hook as declared in plugin metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookType {
    #[serde(rename = "load")]
    Load,
    #[serde(rename = "unload")]
    Unload,
    #[serde(rename = "save:open")]
    SaveOpen,
    #[serde(rename = "save:save")]
    SaveSave,
    #[serde(rename = "character:edit")]
    CharacterEdit,
    #[serde(rename = "ui:render")]
    UiRender,
    #[serde(rename = "menu:add")]
    MenuAdd,
    #[serde(rename = "sync")]
    Sync,
}

impl HookType {
    pub const ALL: [HookType; 8] = [
        HookType::Load,
        HookType::Unload,
        HookType::SaveOpen,
        HookType::SaveSave,
        HookType::CharacterEdit,
        HookType::UiRender,
        HookType::MenuAdd,
        HookType::Sync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::Load => "load",
            HookType::Unload => "unload",
            HookType::SaveOpen => "save:open",
            HookType::SaveSave => "save:save",
            HookType::CharacterEdit => "character:edit",
            HookType::UiRender => "ui:render",
            HookType::MenuAdd => "menu:add",
            HookType::Sync => "sync",
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        HookType::ALL
            .iter()
            .copied()
            .find(|h| h.as_str() == s.trim())
            .ok_or_else(|| RuntimeError::InvalidMetadata(format!("unknown hook '{}'", s)))
    }
}

/// A hook invocation with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum Hook {
    Load,
    Unload,
    SaveOpen { path: PathBuf },
    SaveSave { path: PathBuf },
    CharacterEdit { character_id: i64 },
    UiRender,
    MenuAdd,
    Sync,
}

impl Hook {
    pub fn hook_type(&self) -> HookType {
        match self {
            Hook::Load => HookType::Load,
            Hook::Unload => HookType::Unload,
            Hook::SaveOpen { .. } => HookType::SaveOpen,
            Hook::SaveSave { .. } => HookType::SaveSave,
            Hook::CharacterEdit { .. } => HookType::CharacterEdit,
            Hook::UiRender => HookType::UiRender,
            Hook::MenuAdd => HookType::MenuAdd,
            Hook::Sync => HookType::Sync,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine seam
// ---------------------------------------------------------------------------

/// What a plugin body returns from an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Free-form result produced by the plugin.
    #[serde(default)]
    pub output: Value,
    /// Memory the engine attributes to the run, when it can measure it.
    #[serde(default)]
    pub memory_bytes: Option<u64>,
}

/// Executes one plugin's code. Implemented by the scripting collaborator.
///
/// Implementations must be cancel-safe: the runtime drops the execution
/// future when the deadline fires.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PluginEngine: Send + Sync {
    /// Deliver a hook to the plugin.
    async fn call_hook(&self, hook: &Hook) -> Result<()>;

    /// Run the plugin's main body.
    async fn execute(&self, input: Value) -> Result<ExecutionOutput>;
}

/// Builds an engine for freshly loaded plugin code.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        metadata: &PluginMetadata,
        path: &Path,
        source: &str,
    ) -> Result<Arc<dyn PluginEngine>>;
}

/// Engine that accepts every hook and returns an empty output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEngine;

#[async_trait]
impl PluginEngine for NoopEngine {
    async fn call_hook(&self, _hook: &Hook) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _input: Value) -> Result<ExecutionOutput> {
        Ok(ExecutionOutput::default())
    }
}

/// Factory producing [`NoopEngine`] for every plugin.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEngineFactory;

impl EngineFactory for NoopEngineFactory {
    fn create(
        &self,
        _metadata: &PluginMetadata,
        _path: &Path,
        _source: &str,
    ) -> Result<Arc<dyn PluginEngine>> {
        Ok(Arc::new(NoopEngine))
    }
}
