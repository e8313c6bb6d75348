//! Plugin state snapshots used across a hot reload.
//!
//! A [`PluginState`] is a plain value: taking one never touches the live
//! plugin, and restoring from one is a pure copy back. [`PluginState::diff`]
//! reports field-level changes between two snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::plugins::types::{ExecutionRecord, PluginConfig};

/// Serializable state of one plugin at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    pub plugin_id: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PluginConfig>,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    /// Most recent executions, newest first.
    #[serde(default)]
    pub last_executions: Vec<ExecutionRecord>,
}

impl PluginState {
    pub fn new(plugin_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version: version.into(),
            timestamp: Utc::now(),
            enabled: true,
            config: None,
            data: HashMap::new(),
            last_executions: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| RuntimeError::ReloadValidation {
            plugin: self.plugin_id.clone(),
            reason: reason.to_string(),
        };
        if self.plugin_id.trim().is_empty() {
            return Err(invalid("state has an empty plugin ID"));
        }
        if self.version.trim().is_empty() {
            return Err(invalid("state has an empty version"));
        }
        Ok(())
    }

    /// Overlay `other` onto this state.
    ///
    /// Only states of the same plugin merge. Data keys from `other` replace
    /// or extend ours; its config and version replace ours when present;
    /// the newer timestamp wins.
    pub fn merge(&mut self, other: &PluginState) -> Result<()> {
        if self.plugin_id != other.plugin_id {
            return Err(RuntimeError::ReloadValidation {
                plugin: self.plugin_id.clone(),
                reason: format!(
                    "cannot merge state of '{}' into '{}'",
                    other.plugin_id, self.plugin_id
                ),
            });
        }

        for (key, value) in &other.data {
            self.data.insert(key.clone(), value.clone());
        }
        if other.config.is_some() {
            self.config = other.config.clone();
        }
        if !other.version.is_empty() {
            self.version = other.version.clone();
        }
        if other.timestamp > self.timestamp {
            self.timestamp = other.timestamp;
        }
        Ok(())
    }

    /// Field-level differences going from `self` to `other`.
    pub fn diff(&self, other: &PluginState) -> StateDiff {
        let mut diff = StateDiff {
            plugin_id: self.plugin_id.clone(),
            old_version: self.version.clone(),
            new_version: other.version.clone(),
            ..Default::default()
        };

        if self.version != other.version {
            diff.push("version", Some(Value::from(self.version.as_str())), Some(Value::from(other.version.as_str())));
        }
        if self.enabled != other.enabled {
            diff.push("enabled", Some(Value::from(self.enabled)), Some(Value::from(other.enabled)));
        }
        if self.config != other.config {
            diff.config_changed = true;
            diff.push(
                "config",
                self.config.as_ref().and_then(|c| serde_json::to_value(c).ok()),
                other.config.as_ref().and_then(|c| serde_json::to_value(c).ok()),
            );
        }

        let keys: BTreeSet<&String> = self.data.keys().chain(other.data.keys()).collect();
        for key in keys {
            let field = format!("data.{}", key);
            match (self.data.get(key), other.data.get(key)) {
                (Some(old), Some(new)) if old != new => {
                    diff.push(&field, Some(old.clone()), Some(new.clone()))
                }
                (Some(old), None) => {
                    diff.removed_keys.push(key.clone());
                    diff.push(&field, Some(old.clone()), None);
                }
                (None, Some(new)) => {
                    diff.added_keys.push(key.clone());
                    diff.push(&field, None, Some(new.clone()));
                }
                _ => {}
            }
        }

        diff
    }
}

/// One changed field. `None` means the field was absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub field: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    pub plugin_id: String,
    pub old_version: String,
    pub new_version: String,
    pub changes: Vec<StateChange>,
    pub config_changed: bool,
    pub added_keys: Vec<String>,
    pub removed_keys: Vec<String>,
}

impl StateDiff {
    fn push(&mut self, field: &str, old_value: Option<Value>, new_value: Option<Value>) {
        self.changes.push(StateChange {
            field: field.to_string(),
            old_value,
            new_value,
        });
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn summary(&self) -> String {
        if !self.has_changes() {
            return "No changes detected".to_string();
        }
        let show = |v: &Option<Value>| v.as_ref().map_or("<none>".to_string(), Value::to_string);

        let mut summary = format!("{} change(s) detected:\n", self.changes.len());
        for change in &self.changes {
            summary.push_str(&format!(
                "  - {}: {} -> {}\n",
                change.field,
                show(&change.old_value),
                show(&change.new_value)
            ));
        }
        summary
    }
}

/// A named collection of plugin states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub states: BTreeMap<String, PluginState>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            states: BTreeMap::new(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert a state, replacing one for the same plugin.
    pub fn add(&mut self, state: PluginState) -> Result<()> {
        state.validate()?;
        self.states.insert(state.plugin_id.clone(), state);
        Ok(())
    }

    pub fn get(&self, plugin_id: &str) -> Option<&PluginState> {
        self.states.get(plugin_id)
    }

    pub fn remove(&mut self, plugin_id: &str) -> Option<PluginState> {
        self.states.remove(plugin_id)
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        self.states.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
