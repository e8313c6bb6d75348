//! Plugin registry
//!
//! This module provides the `PluginRegistry` struct holding every loaded
//! plugin together with its host-editable configuration and free-form data.
//! The registry itself is not synchronised; the manager wraps it in a lock and
//! hands out clones so no caller keeps a reference into the map.

use std::collections::HashMap;

use serde_json::Value;
use tracing::info;

use crate::error::{Result, RuntimeError};

use super::types::{Plugin, PluginConfig};

/// Everything the registry stores for one plugin.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub plugin: Plugin,
    pub config: PluginConfig,
    /// Arbitrary key/value data attached by the host or the plugin.
    pub data: HashMap<String, Value>,
}

/// A registry of loaded plugins keyed by plugin ID.
///
/// # Example
///
/// ```rust
/// use std::path::PathBuf;
/// use std::sync::Arc;
/// use plugin_runtime::hooks::NoopEngine;
/// use plugin_runtime::plugins::{Plugin, PluginConfig, PluginMetadata, PluginRegistry};
///
/// let metadata = PluginMetadata {
///     id: "example".to_string(),
///     name: "Example".to_string(),
///     version: "1.0.0".to_string(),
///     author: "me".to_string(),
///     ..Default::default()
/// };
/// let config = PluginConfig::from_metadata(&metadata);
/// let plugin = Plugin::new(metadata, PathBuf::from("example.lua"), Arc::new(NoopEngine));
///
/// let mut registry = PluginRegistry::new();
/// registry.register(plugin, config).unwrap();
/// assert_eq!(registry.plugin_count(), 1);
/// assert!(registry.contains("example"));
/// ```
#[derive(Debug, Default)]
pub struct PluginRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl PluginRegistry {
    /// Create a new empty plugin registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its ID.
    ///
    /// # Returns
    /// `Ok(())` on success, or `RuntimeError::PluginAlreadyLoaded` if another
    /// plugin with the same ID is registered. The registry is unchanged on error.
    pub fn register(&mut self, plugin: Plugin, config: PluginConfig) -> Result<()> {
        if self.entries.contains_key(&plugin.id) {
            return Err(RuntimeError::PluginAlreadyLoaded(plugin.id));
        }

        info!(
            plugin = %plugin.id,
            version = %plugin.version,
            "Registered plugin"
        );

        self.entries.insert(
            plugin.id.clone(),
            RegistryEntry {
                plugin,
                config,
                data: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Insert or overwrite a full entry. Used when restoring a snapshot.
    pub fn restore(&mut self, entry: RegistryEntry) {
        self.entries.insert(entry.plugin.id.clone(), entry);
    }

    /// Remove a plugin and return its entry.
    pub fn remove(&mut self, id: &str) -> Option<RegistryEntry> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(id)
    }

    pub fn get_plugin(&self, id: &str) -> Option<&Plugin> {
        self.entries.get(id).map(|e| &e.plugin)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Enable or disable a plugin, keeping plugin and config in step.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        entry.plugin.enabled = enabled;
        entry.config.enabled = enabled;
        Ok(())
    }

    /// Get the number of registered plugins.
    pub fn plugin_count(&self) -> usize {
        self.entries.len()
    }

    pub fn enabled_count(&self) -> usize {
        self.entries.values().filter(|e| e.plugin.enabled).count()
    }

    /// All plugins, sorted by ID.
    pub fn plugins(&self) -> Vec<&Plugin> {
        let mut plugins: Vec<&Plugin> = self.entries.values().map(|e| &e.plugin).collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }

    /// Enabled plugins whose configuration subscribes to `hook`, sorted by ID.
    pub fn subscribers(&self, hook: crate::hooks::HookType) -> Vec<&Plugin> {
        self.plugins()
            .into_iter()
            .filter(|p| {
                p.enabled
                    && self
                        .entries
                        .get(&p.id)
                        .is_some_and(|e| e.config.handles(hook))
            })
            .collect()
    }
}
