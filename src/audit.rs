//! Audit trail of plugin operations
//!
//! An append-only, bounded log of everything the runtime does on behalf of a
//! plugin: loads, unloads, executions, permission use and denials, security
//! violations, errors and reloads. When the log is full the oldest entry is
//! evicted. Permission-use and error counts are derived from the retained
//! entries, so nothing outlives the ring.
//!
//! The log can be exported as CSV (fixed column order) or JSON.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::plugins::types::ExecutionStatus;

pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

const CSV_HEADER: [&str; 9] = [
    "EventID",
    "PluginID",
    "EventType",
    "Action",
    "PermissionID",
    "Status",
    "Error",
    "Timestamp",
    "DurationUS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Load,
    Unload,
    Execute,
    PermissionUsed,
    PermissionDenied,
    SecurityViolation,
    Error,
    Reload,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Load => "load",
            AuditEventType::Unload => "unload",
            AuditEventType::Execute => "execute",
            AuditEventType::PermissionUsed => "permission_used",
            AuditEventType::PermissionDenied => "permission_denied",
            AuditEventType::SecurityViolation => "security_violation",
            AuditEventType::Error => "error",
            AuditEventType::Reload => "reload",
        }
    }

    /// Upper-case action label written to the `Action` column.
    pub fn action(&self) -> &'static str {
        match self {
            AuditEventType::Load => "LOAD",
            AuditEventType::Unload => "UNLOAD",
            AuditEventType::Execute => "EXECUTE",
            AuditEventType::PermissionUsed => "ACCESS",
            AuditEventType::PermissionDenied => "DENIED",
            AuditEventType::SecurityViolation => "SECURITY",
            AuditEventType::Error => "ERROR",
            AuditEventType::Reload => "RELOAD",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Denied,
    Error,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Denied => "denied",
            AuditStatus::Error => "error",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record. Field names match the CSV export columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    #[serde(rename = "EventID")]
    pub event_id: String,
    #[serde(rename = "PluginID")]
    pub plugin_id: String,
    #[serde(rename = "EventType")]
    pub event_type: AuditEventType,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "PermissionID")]
    pub permission_id: Option<String>,
    #[serde(rename = "Status")]
    pub status: AuditStatus,
    #[serde(rename = "Error")]
    pub error: Option<String>,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "DurationUS")]
    pub duration_us: u64,
    #[serde(rename = "Details")]
    pub details: HashMap<String, Value>,
}

impl AuditLog {
    pub fn new(plugin_id: impl Into<String>, event_type: AuditEventType, status: AuditStatus) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            plugin_id: plugin_id.into(),
            event_type,
            action: event_type.action().to_string(),
            permission_id: None,
            status,
            error: None,
            timestamp: Utc::now(),
            duration_us: 0,
            details: HashMap::new(),
        }
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permission_id = Some(permission.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        let error = error.into();
        if !error.is_empty() {
            self.error = Some(error);
        }
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_us = duration.as_micros() as u64;
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    fn csv_row(&self) -> String {
        let duration = self.duration_us.to_string();
        let timestamp = self.timestamp.to_rfc3339();
        [
            self.event_id.as_str(),
            self.plugin_id.as_str(),
            self.event_type.as_str(),
            self.action.as_str(),
            self.permission_id.as_deref().unwrap_or(""),
            self.status.as_str(),
            self.error.as_deref().unwrap_or(""),
            timestamp.as_str(),
            duration.as_str(),
        ]
        .iter()
        .map(|field| csv_escape(field))
        .collect::<Vec<_>>()
        .join(",")
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Aggregates over the retained log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditStats {
    pub total_events: usize,
    pub total_plugins: usize,
    pub total_permissions: usize,
    pub total_errors: usize,
    pub events_by_type: BTreeMap<String, usize>,
    pub events_by_status: BTreeMap<String, usize>,
    /// Events with status `denied`.
    pub permission_violations: usize,
    pub security_violations: usize,
}

#[derive(Serialize)]
struct AuditExport<'a> {
    #[serde(rename = "Timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "Events")]
    events: Vec<&'a AuditLog>,
    #[serde(rename = "Stats")]
    stats: AuditStats,
}

#[derive(Debug, Default)]
struct AuditState {
    logs: VecDeque<AuditLog>,
}

impl AuditState {
    fn permission_use(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for permission in self.logs.iter().filter_map(|log| log.permission_id.as_ref()) {
            *counts.entry(permission.clone()).or_default() += 1;
        }
        counts
    }

    fn errors(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for error in self.logs.iter().filter_map(|log| log.error.as_ref()) {
            *counts.entry(error.clone()).or_default() += 1;
        }
        counts
    }

    fn stats(&self) -> AuditStats {
        let mut stats = AuditStats {
            total_events: self.logs.len(),
            total_permissions: self.permission_use().len(),
            total_errors: self.errors().len(),
            ..Default::default()
        };
        let mut plugins = HashSet::new();
        for log in &self.logs {
            plugins.insert(log.plugin_id.as_str());
            *stats
                .events_by_type
                .entry(log.event_type.to_string())
                .or_default() += 1;
            *stats
                .events_by_status
                .entry(log.status.to_string())
                .or_default() += 1;
            if log.status == AuditStatus::Denied {
                stats.permission_violations += 1;
            }
            if log.event_type == AuditEventType::SecurityViolation {
                stats.security_violations += 1;
            }
        }
        stats.total_plugins = plugins.len();
        stats
    }
}

/// Thread-safe bounded audit log.
#[derive(Debug)]
pub struct AuditLogger {
    state: RwLock<AuditState>,
    capacity: usize,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(AuditState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Append a record, evicting the oldest one when full.
    pub fn record(&self, log: AuditLog) {
        debug!(
            plugin = %log.plugin_id,
            event = %log.event_type,
            status = %log.status,
            "Audit event"
        );

        let mut state = self.state.write();
        if state.logs.len() >= self.capacity {
            state.logs.pop_front();
        }
        state.logs.push_back(log);
    }

    pub fn log_permission_used(&self, plugin_id: &str, permission: &str) {
        self.record(
            AuditLog::new(plugin_id, AuditEventType::PermissionUsed, AuditStatus::Success)
                .permission(permission)
                .detail("permission_type", "access"),
        );
    }

    pub fn log_permission_denied(&self, plugin_id: &str, permission: &str, reason: &str) {
        self.record(
            AuditLog::new(plugin_id, AuditEventType::PermissionDenied, AuditStatus::Denied)
                .permission(permission)
                .error(reason)
                .detail("permission_type", "access")
                .detail("reason", reason),
        );
    }

    pub fn log_plugin_load(&self, plugin_id: &str, version: &str) {
        self.record(
            AuditLog::new(plugin_id, AuditEventType::Load, AuditStatus::Success)
                .detail("version", version),
        );
    }

    pub fn log_plugin_unload(&self, plugin_id: &str) {
        self.record(AuditLog::new(
            plugin_id,
            AuditEventType::Unload,
            AuditStatus::Success,
        ));
    }

    pub fn log_execution(
        &self,
        plugin_id: &str,
        duration: Duration,
        status: ExecutionStatus,
        error: Option<&str>,
    ) {
        let audit_status = match status {
            ExecutionStatus::Success => AuditStatus::Success,
            ExecutionStatus::Error | ExecutionStatus::Timeout => AuditStatus::Error,
        };
        self.record(
            AuditLog::new(plugin_id, AuditEventType::Execute, audit_status)
                .duration(duration)
                .error(error.unwrap_or_default())
                .detail("outcome", status.as_str())
                .detail("duration_microseconds", duration.as_micros() as u64),
        );
    }

    pub fn log_security_violation(&self, plugin_id: &str, violation_type: &str, description: &str) {
        self.record(
            AuditLog::new(
                plugin_id,
                AuditEventType::SecurityViolation,
                AuditStatus::Denied,
            )
            .error(description)
            .detail("violation_type", violation_type),
        );
    }

    pub fn log_error(&self, plugin_id: &str, message: &str) {
        self.record(
            AuditLog::new(plugin_id, AuditEventType::Error, AuditStatus::Error)
                .error(message)
                .detail("error_category", "plugin_error"),
        );
    }

    pub fn log_reload(&self, plugin_id: &str, outcome: &str, error: Option<&str>) {
        let status = if error.is_some() {
            AuditStatus::Error
        } else {
            AuditStatus::Success
        };
        self.record(
            AuditLog::new(plugin_id, AuditEventType::Reload, status)
                .error(error.unwrap_or_default())
                .detail("outcome", outcome),
        );
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn filtered(&self, keep: impl Fn(&AuditLog) -> bool) -> Vec<AuditLog> {
        self.state
            .read()
            .logs
            .iter()
            .filter(|log| keep(log))
            .cloned()
            .collect()
    }

    /// Every retained event of one plugin, oldest first.
    pub fn plugin_trail(&self, plugin_id: &str) -> Vec<AuditLog> {
        self.filtered(|log| log.plugin_id == plugin_id)
    }

    /// Events strictly between `start` and `end`.
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<AuditLog> {
        self.filtered(|log| log.timestamp > start && log.timestamp < end)
    }

    pub fn by_type(&self, event_type: AuditEventType) -> Vec<AuditLog> {
        self.filtered(|log| log.event_type == event_type)
    }

    pub fn by_status(&self, status: AuditStatus) -> Vec<AuditLog> {
        self.filtered(|log| log.status == status)
    }

    /// The newest `limit` events between `start` and `end`, in chronological order.
    pub fn timeline(&self, start: DateTime<Utc>, end: DateTime<Utc>, limit: usize) -> Vec<AuditLog> {
        let mut events = self.between(start, end);
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        events
    }

    pub fn all(&self) -> Vec<AuditLog> {
        self.state.read().logs.iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.state.read().logs.len()
    }

    pub fn permission_usage(&self) -> HashMap<String, usize> {
        self.state.read().permission_use()
    }

    /// The `n` most used permissions, most used first.
    pub fn top_permissions(&self, n: usize) -> Vec<String> {
        top_n(&self.state.read().permission_use(), n)
    }

    /// The `n` most frequent error messages, most frequent first.
    pub fn top_errors(&self, n: usize) -> Vec<String> {
        top_n(&self.state.read().errors(), n)
    }

    pub fn stats(&self) -> AuditStats {
        self.state.read().stats()
    }

    pub fn report(&self) -> String {
        let stats = self.stats();
        let mut report = String::from("=== Audit Log Report ===\n");
        report.push_str(&format!("Generated: {}\n\n", Utc::now().to_rfc3339()));
        report.push_str(&format!("Total Events: {}\n", stats.total_events));
        report.push_str(&format!("Total Plugins: {}\n", stats.total_plugins));
        report.push_str(&format!(
            "Permission Violations: {}\n",
            stats.permission_violations
        ));
        report.push_str(&format!(
            "Security Violations: {}\n",
            stats.security_violations
        ));
        report.push_str("\n--- Event Summary ---\n");
        for (event_type, count) in &stats.events_by_type {
            report.push_str(&format!("{}: {}\n", event_type, count));
        }
        report
    }

    // -----------------------------------------------------------------------
    // Export & retention
    // -----------------------------------------------------------------------

    pub fn export_csv(&self, path: &Path) -> Result<()> {
        let mut out = CSV_HEADER.join(",");
        out.push('\n');
        let count = {
            let state = self.state.read();
            for log in &state.logs {
                out.push_str(&log.csv_row());
                out.push('\n');
            }
            state.logs.len()
        };
        fs::write(path, out)?;
        info!(path = %path.display(), count, "Exported audit log as CSV");
        Ok(())
    }

    pub fn export_json(&self, path: &Path) -> Result<()> {
        let json = {
            let state = self.state.read();
            let export = AuditExport {
                timestamp: Utc::now(),
                events: state.logs.iter().collect(),
                stats: state.stats(),
            };
            serde_json::to_string_pretty(&export)?
        };
        fs::write(path, json)?;
        info!(path = %path.display(), "Exported audit log as JSON");
        Ok(())
    }

    /// Drop events older than `age`. Returns how many were removed.
    pub fn clear_older_than(&self, age: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return 0;
        };

        let mut state = self.state.write();
        let before = state.logs.len();
        state.logs.retain(|log| log.timestamp > cutoff);
        before - state.logs.len()
    }

    /// Remove every event.
    pub fn clear_all(&self) {
        *self.state.write() = AuditState::default();
    }
}

fn top_n(counts: &HashMap<String, usize>, n: usize) -> Vec<String> {
    let mut ranked: Vec<(&String, &usize)> = counts.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    ranked.into_iter().take(n).map(|(k, _)| k.clone()).collect()
}
