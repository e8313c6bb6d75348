//! Plugin types
//!
//! This module defines the data model of the plugin runtime: the declarative
//! metadata read from a plugin's manifest, the per-plugin configuration the
//! host can edit, the runtime `Plugin` handle, and execution records.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::hooks::{ExecutionOutput, Hook, HookType, PluginEngine};

use super::resolver::DependencySpec;
use super::version::Version;

/// Well-known permission strings. The set is open: hosts may define more.
pub mod permissions {
    pub const READ_SAVE: &str = "read_save";
    pub const WRITE_SAVE: &str = "write_save";
    pub const UI_DISPLAY: &str = "ui_display";
    pub const EVENTS: &str = "events";
    /// Checked by the manager before every plugin execution.
    pub const EXECUTE: &str = "execute";
    /// Matches every permission in allow and deny lists.
    pub const WILDCARD: &str = "*";
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// The manifest of a plugin, read from its header comments or sidecar JSON.
///
/// # Example
///
/// ```json
/// {
///   "id": "auto-backup",
///   "name": "Auto Backup",
///   "version": "1.2.0",
///   "author": "Jane",
///   "permissions": ["read_save", "write_save"],
///   "hooks": ["save:save"],
///   "dependencies": ["core-utils@^1.0"],
///   "minAppVersion": "0.1.0"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    pub tags: Vec<String>,
    /// Dependency specs: a plugin ID optionally followed by `@constraint`.
    pub dependencies: Vec<String>,
    /// Lowest host version the plugin supports (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_app_version: Option<String>,
    /// Highest host version the plugin supports (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_app_version: Option<String>,
    pub permissions: Vec<String>,
    pub hooks: Vec<String>,
}

impl PluginMetadata {
    /// Check required fields and the syntax of every declared value.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("id", &self.id),
            ("name", &self.name),
            ("version", &self.version),
            ("author", &self.author),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(RuntimeError::InvalidMetadata(format!(
                    "plugin {} is required",
                    field
                )));
            }
        }

        self.parsed_version()?;

        for hook in &self.hooks {
            hook.parse::<HookType>()?;
        }

        if self.permissions.iter().any(|p| p.trim().is_empty()) {
            return Err(RuntimeError::InvalidMetadata(format!(
                "plugin '{}' declares an empty permission",
                self.id
            )));
        }

        let deps = self.dependency_specs()?;
        if deps.iter().any(|d| d.id == self.id) {
            // Self-edges are legal graph input but almost always a typo.
            tracing::warn!(plugin = %self.id, "Plugin declares a dependency on itself");
        }

        for bound in [&self.min_app_version, &self.max_app_version]
            .into_iter()
            .flatten()
        {
            bound.parse::<Version>()?;
        }

        Ok(())
    }

    pub fn parsed_version(&self) -> Result<Version> {
        self.version.parse()
    }

    /// Parse every `id@constraint` dependency entry.
    pub fn dependency_specs(&self) -> Result<Vec<DependencySpec>> {
        self.dependencies.iter().map(|d| d.parse()).collect()
    }

    /// Check the host version against the declared compatibility range.
    pub fn check_host_compatibility(&self, host: &Version) -> Result<()> {
        let incompatible = |reason: String| RuntimeError::Incompatible {
            plugin: self.id.clone(),
            host: host.to_string(),
            reason,
        };

        if let Some(min) = &self.min_app_version {
            let min: Version = min.parse()?;
            if host < &min {
                return Err(incompatible(format!("requires at least {}", min)));
            }
        }
        if let Some(max) = &self.max_app_version {
            let max: Version = max.parse()?;
            if host > &max {
                return Err(incompatible(format!("supports at most {}", max)));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Host-editable configuration of one loaded plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub enabled: bool,
    /// Arbitrary plugin settings, preserved across hot reloads.
    pub settings: HashMap<String, Value>,
    /// Hooks this plugin receives from `call_hook`.
    pub hooks: Vec<String>,
    pub permissions: Vec<String>,
}

impl PluginConfig {
    /// Seed a configuration from freshly parsed metadata.
    pub fn from_metadata(metadata: &PluginMetadata) -> Self {
        Self {
            name: metadata.name.clone(),
            version: metadata.version.clone(),
            author: metadata.author.clone(),
            description: metadata.description.clone(),
            enabled: true,
            settings: HashMap::new(),
            hooks: metadata.hooks.clone(),
            permissions: metadata.permissions.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("version", &self.version),
            ("author", &self.author),
        ] {
            if value.trim().is_empty() {
                return Err(RuntimeError::Config(format!(
                    "plugin config {} is required",
                    field
                )));
            }
        }
        for hook in &self.hooks {
            hook.parse::<HookType>()
                .map_err(|e| RuntimeError::Config(e.to_string()))?;
        }
        Ok(())
    }

    pub fn handles(&self, hook: HookType) -> bool {
        self.hooks.iter().any(|h| h == hook.as_str())
    }
}

// ---------------------------------------------------------------------------
// Runtime plugin
// ---------------------------------------------------------------------------

/// A loaded plugin.
///
/// Cloning is cheap: the engine is shared, so a clone taken out of the
/// registry can be executed without holding any lock.
#[derive(Clone)]
pub struct Plugin {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub enabled: bool,
    pub loaded_at: DateTime<Utc>,
    /// File the plugin was loaded from; reloads read the same path.
    pub path: PathBuf,
    pub metadata: PluginMetadata,
    engine: Arc<dyn PluginEngine>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("enabled", &self.enabled)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Plugin {
    /// Create a plugin from validated metadata, enabled by default.
    pub fn new(metadata: PluginMetadata, path: PathBuf, engine: Arc<dyn PluginEngine>) -> Self {
        Self {
            id: metadata.id.clone(),
            name: metadata.name.clone(),
            version: metadata.version.clone(),
            author: metadata.author.clone(),
            description: metadata.description.clone(),
            enabled: true,
            loaded_at: Utc::now(),
            path,
            metadata,
            engine,
        }
    }

    pub fn permissions(&self) -> &[String] {
        &self.metadata.permissions
    }

    /// Run the `load` lifecycle hook.
    pub async fn load(&self) -> Result<()> {
        self.call_hook(&Hook::Load).await
    }

    /// Run the `unload` lifecycle hook.
    pub async fn unload(&self) -> Result<()> {
        self.call_hook(&Hook::Unload).await
    }

    pub async fn call_hook(&self, hook: &Hook) -> Result<()> {
        self.engine.call_hook(hook).await
    }

    pub async fn execute(&self, input: Value) -> Result<ExecutionOutput> {
        self.engine.execute(input).await
    }
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// Outcome class of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a plugin's execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub plugin_id: String,
    pub plugin_name: String,
    pub plugin_version: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_metadata() -> PluginMetadata {
        PluginMetadata {
            id: "auto-backup".to_string(),
            name: "Auto Backup".to_string(),
            version: "1.2.0".to_string(),
            author: "Jane".to_string(),
            permissions: vec![permissions::READ_SAVE.to_string()],
            hooks: vec!["save:save".to_string()],
            dependencies: vec!["core-utils@^1.0".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_metadata_ok() {
        assert!(valid_metadata().validate().is_ok());
    }

    #[test]
    fn test_validate_metadata_required_fields() {
        for field in ["id", "name", "version", "author"] {
            let mut m = valid_metadata();
            match field {
                "id" => m.id.clear(),
                "name" => m.name.clear(),
                "version" => m.version.clear(),
                _ => m.author.clear(),
            }
            let err = m.validate().unwrap_err();
            assert!(err.to_string().contains(&format!("plugin {} is required", field)));
        }
    }

    #[test]
    fn test_validate_metadata_bad_version_and_hook() {
        let mut m = valid_metadata();
        m.version = "one.two".to_string();
        assert!(matches!(
            m.validate(),
            Err(RuntimeError::InvalidVersion { .. })
        ));

        let mut m = valid_metadata();
        m.hooks = vec!["on_save".to_string()];
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_metadata_json_uses_camel_case() {
        let m: PluginMetadata = serde_json::from_value(json!({
            "id": "x",
            "name": "X",
            "version": "1.0.0",
            "author": "a",
            "minAppVersion": "0.2.0"
        }))
        .unwrap();
        assert_eq!(m.min_app_version.as_deref(), Some("0.2.0"));
        assert!(m.dependencies.is_empty());
    }

    #[test]
    fn test_host_compatibility() {
        let mut m = valid_metadata();
        m.min_app_version = Some("1.0.0".to_string());
        m.max_app_version = Some("1.9.0".to_string());

        assert!(m.check_host_compatibility(&Version::new(1, 5, 0)).is_ok());
        assert!(matches!(
            m.check_host_compatibility(&Version::new(0, 9, 0)),
            Err(RuntimeError::Incompatible { .. })
        ));
        assert!(m.check_host_compatibility(&Version::new(2, 0, 0)).is_err());
    }

    #[test]
    fn test_config_from_metadata() {
        let config = PluginConfig::from_metadata(&valid_metadata());
        assert!(config.enabled);
        assert!(config.settings.is_empty());
        assert!(config.handles(HookType::SaveSave));
        assert!(!config.handles(HookType::Sync));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = PluginConfig::from_metadata(&valid_metadata());
        config.author.clear();
        assert!(config.validate().is_err());

        let mut config = PluginConfig::from_metadata(&valid_metadata());
        config.hooks.push("bogus".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_execution_status_serde() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Timeout).unwrap(),
            "\"timeout\""
        );
    }
}
