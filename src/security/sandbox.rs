//! Sandbox policy engine
//!
//! Each plugin may carry one [`SandboxPolicy`]: an allow-list, a deny-list and
//! resource ceilings. Permission checks are enforced (the caller is told to
//! refuse the action); memory and time checks are detective only and merely
//! record a violation, since nothing here can stop a running plugin.
//!
//! A plugin without an active policy is unrestricted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};
use crate::plugins::types::permissions::WILDCARD;

/// Violations kept when no capacity is configured.
pub const DEFAULT_VIOLATION_CAPACITY: usize = 10_000;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    None,
    #[default]
    Basic,
    Strict,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::None => "none",
            IsolationLevel::Basic => "basic",
            IsolationLevel::Strict => "strict",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(IsolationLevel::None),
            "basic" => Ok(IsolationLevel::Basic),
            "strict" => Ok(IsolationLevel::Strict),
            other => Err(RuntimeError::InvalidPolicy(format!(
                "invalid isolation level: {}",
                other
            ))),
        }
    }
}

/// Runtime constraints for one plugin. Ceilings of `0` mean unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub plugin_id: String,
    pub allowed_permissions: Vec<String>,
    pub denied_permissions: Vec<String>,
    pub max_memory_mb: u64,
    pub max_cpu_percent: u32,
    pub timeout_seconds: u64,
    pub isolation_level: IsolationLevel,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// An inactive policy is ignored by every check.
    pub is_active: bool,
}

impl SandboxPolicy {
    /// An empty, active, basic-isolation policy with no ceilings.
    pub fn new(plugin_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            plugin_id: plugin_id.into(),
            allowed_permissions: Vec::new(),
            denied_permissions: Vec::new(),
            max_memory_mb: 0,
            max_cpu_percent: 0,
            timeout_seconds: 0,
            isolation_level: IsolationLevel::Basic,
            created_at: now,
            modified_at: now,
            is_active: true,
        }
    }

    pub fn with_allowed<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_denied<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denied_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limits(mut self, max_memory_mb: u64, max_cpu_percent: u32, timeout_seconds: u64) -> Self {
        self.max_memory_mb = max_memory_mb;
        self.max_cpu_percent = max_cpu_percent;
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.plugin_id.trim().is_empty() {
            return Err(RuntimeError::InvalidPolicy("plugin ID is required".to_string()));
        }
        if self.max_cpu_percent > 100 {
            return Err(RuntimeError::InvalidPolicy(format!(
                "max_cpu_percent must be at most 100, got {}",
                self.max_cpu_percent
            )));
        }
        Ok(())
    }

    fn is_denied(&self, permission: &str) -> bool {
        self.denied_permissions
            .iter()
            .any(|d| d == permission || d == WILDCARD)
    }

    fn is_allowed(&self, permission: &str) -> bool {
        self.allowed_permissions.is_empty()
            || self
                .allowed_permissions
                .iter()
                .any(|a| a == permission || a == WILDCARD)
    }
}

// ---------------------------------------------------------------------------
// Violations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    PermissionDenied,
    MemoryExceeded,
    CpuExceeded,
    Timeout,
    IsolationBreach,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationType::PermissionDenied => "permission_denied",
            ViolationType::MemoryExceeded => "memory_exceeded",
            ViolationType::CpuExceeded => "cpu_exceeded",
            ViolationType::Timeout => "timeout",
            ViolationType::IsolationBreach => "isolation_breach",
        }
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded policy violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub violation_id: String,
    pub plugin_id: String,
    pub violation_type: ViolationType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    /// Whether the action was prevented rather than merely flagged.
    pub enforced: bool,
    pub details: HashMap<String, Value>,
}

/// Outcome of a sandbox check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    /// Denial reason; empty when allowed.
    pub fn reason(&self) -> &str {
        match self {
            Verdict::Allow => "",
            Verdict::Deny(reason) => reason,
        }
    }
}

/// Aggregate counts over the current violation buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViolationStats {
    pub total: usize,
    pub enforced: usize,
    pub not_enforced: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub critical: usize,
}

// ---------------------------------------------------------------------------
// SandboxManager
// ---------------------------------------------------------------------------

/// Policy table plus a bounded violation log.
///
/// Policies and violations sit behind separate locks so recording a violation
/// never happens while the policy table is held.
#[derive(Debug)]
pub struct SandboxManager {
    policies: RwLock<HashMap<String, SandboxPolicy>>,
    violations: Mutex<VecDeque<SecurityViolation>>,
    capacity: usize,
}

impl Default for SandboxManager {
    fn default() -> Self {
        Self::new(DEFAULT_VIOLATION_CAPACITY)
    }
}

impl SandboxManager {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            policies: RwLock::new(HashMap::new()),
            violations: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Insert or replace the policy for `policy.plugin_id`.
    ///
    /// The stored policy is always active and gets fresh timestamps.
    pub fn set_policy(&self, mut policy: SandboxPolicy) -> Result<()> {
        policy.validate()?;
        let now = Utc::now();
        policy.created_at = now;
        policy.modified_at = now;
        policy.is_active = true;

        debug!(
            plugin = %policy.plugin_id,
            allowed = policy.allowed_permissions.len(),
            denied = policy.denied_permissions.len(),
            isolation = %policy.isolation_level,
            "Sandbox policy set"
        );
        self.policies.write().insert(policy.plugin_id.clone(), policy);
        Ok(())
    }

    pub fn get_policy(&self, plugin_id: &str) -> Option<SandboxPolicy> {
        self.policies.read().get(plugin_id).cloned()
    }

    pub fn remove_policy(&self, plugin_id: &str) -> Result<SandboxPolicy> {
        self.policies.write().remove(plugin_id).ok_or_else(|| {
            RuntimeError::InvalidPolicy(format!("policy not found for plugin: {}", plugin_id))
        })
    }

    /// Toggle whether a policy participates in checks.
    pub fn set_policy_active(&self, plugin_id: &str, active: bool) -> Result<()> {
        let mut policies = self.policies.write();
        let policy = policies.get_mut(plugin_id).ok_or_else(|| {
            RuntimeError::InvalidPolicy(format!("policy not found for plugin: {}", plugin_id))
        })?;
        policy.is_active = active;
        policy.modified_at = Utc::now();
        Ok(())
    }

    /// Copy of every policy keyed by plugin ID.
    pub fn policies(&self) -> HashMap<String, SandboxPolicy> {
        self.policies.read().clone()
    }

    pub fn policy_count(&self) -> usize {
        self.policies.read().len()
    }

    fn active_policy(&self, plugin_id: &str) -> Option<SandboxPolicy> {
        self.policies
            .read()
            .get(plugin_id)
            .filter(|p| p.is_active)
            .cloned()
    }

    /// Decide whether `plugin_id` may use `permission`.
    ///
    /// The deny-list wins over the allow-list. A non-empty allow-list must
    /// contain the permission or the wildcard.
    pub fn check_permission(&self, plugin_id: &str, permission: &str) -> Verdict {
        let Some(policy) = self.active_policy(plugin_id) else {
            return Verdict::Allow;
        };

        if policy.is_denied(permission) {
            self.record_violation(
                plugin_id,
                ViolationType::PermissionDenied,
                format!("Permission '{}' is denied", permission),
                Severity::Critical,
                true,
                [("permission", Value::from(permission))],
            );
            return Verdict::Deny(format!("permission '{}' is denied by policy", permission));
        }

        if !policy.is_allowed(permission) {
            self.record_violation(
                plugin_id,
                ViolationType::PermissionDenied,
                format!("Permission '{}' not in allowed list", permission),
                Severity::Warning,
                true,
                [("permission", Value::from(permission))],
            );
            return Verdict::Deny(format!("permission '{}' not allowed by policy", permission));
        }

        Verdict::Allow
    }

    /// Flag memory use above the policy ceiling. Never prevents anything.
    pub fn verify_memory_usage(&self, plugin_id: &str, memory_bytes: u64) -> Verdict {
        let Some(policy) = self.active_policy(plugin_id) else {
            return Verdict::Allow;
        };
        if policy.max_memory_mb == 0 {
            return Verdict::Allow;
        }

        let memory_mb = memory_bytes / 1024 / 1024;
        if memory_mb > policy.max_memory_mb {
            self.record_violation(
                plugin_id,
                ViolationType::MemoryExceeded,
                format!(
                    "Memory usage {}MB exceeds limit {}MB",
                    memory_mb, policy.max_memory_mb
                ),
                Severity::Critical,
                false,
                [
                    ("memory_mb", Value::from(memory_mb)),
                    ("limit_mb", Value::from(policy.max_memory_mb)),
                ],
            );
            return Verdict::Deny(format!(
                "memory limit exceeded: {}MB > {}MB",
                memory_mb, policy.max_memory_mb
            ));
        }
        Verdict::Allow
    }

    /// Flag an execution that ran past the policy timeout. Never prevents anything.
    pub fn verify_execution_time(&self, plugin_id: &str, duration: Duration) -> Verdict {
        let Some(policy) = self.active_policy(plugin_id) else {
            return Verdict::Allow;
        };
        if policy.timeout_seconds == 0 {
            return Verdict::Allow;
        }

        let limit = Duration::from_secs(policy.timeout_seconds);
        if duration > limit {
            self.record_violation(
                plugin_id,
                ViolationType::Timeout,
                format!("Execution time {:?} exceeds timeout {:?}", duration, limit),
                Severity::Critical,
                false,
                [
                    ("duration_ms", Value::from(duration.as_millis() as u64)),
                    ("limit_ms", Value::from(limit.as_millis() as u64)),
                ],
            );
            return Verdict::Deny(format!("execution timeout: {:?} > {:?}", duration, limit));
        }
        Verdict::Allow
    }

    /// Add `permission` to the deny-list, creating a basic policy if needed.
    pub fn deny_permission(&self, plugin_id: &str, permission: &str) -> Result<()> {
        self.edit_policy(plugin_id, |policy| {
            if !policy.denied_permissions.iter().any(|d| d == permission) {
                policy.denied_permissions.push(permission.to_string());
            }
        })
    }

    /// Add `permission` to the allow-list, creating a basic policy if needed.
    pub fn allow_permission(&self, plugin_id: &str, permission: &str) -> Result<()> {
        self.edit_policy(plugin_id, |policy| {
            if !policy.allowed_permissions.iter().any(|a| a == permission) {
                policy.allowed_permissions.push(permission.to_string());
            }
        })
    }

    fn edit_policy(&self, plugin_id: &str, edit: impl FnOnce(&mut SandboxPolicy)) -> Result<()> {
        if plugin_id.trim().is_empty() {
            return Err(RuntimeError::InvalidPolicy("plugin ID is required".to_string()));
        }
        let mut policies = self.policies.write();
        let policy = policies
            .entry(plugin_id.to_string())
            .or_insert_with(|| SandboxPolicy::new(plugin_id));
        edit(policy);
        policy.modified_at = Utc::now();
        Ok(())
    }

    fn record_violation<const N: usize>(
        &self,
        plugin_id: &str,
        violation_type: ViolationType,
        message: String,
        severity: Severity,
        enforced: bool,
        details: [(&str, Value); N],
    ) {
        warn!(
            plugin = %plugin_id,
            kind = %violation_type,
            severity = %severity,
            enforced,
            "{}",
            message
        );

        let violation = SecurityViolation {
            violation_id: uuid::Uuid::new_v4().to_string(),
            plugin_id: plugin_id.to_string(),
            violation_type,
            message,
            timestamp: Utc::now(),
            severity,
            enforced,
            details: details
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        };

        let mut violations = self.violations.lock();
        if violations.len() >= self.capacity {
            violations.pop_front();
        }
        violations.push_back(violation);
    }

    pub fn violations(&self, plugin_id: &str) -> Vec<SecurityViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    pub fn all_violations(&self) -> Vec<SecurityViolation> {
        self.violations.lock().iter().cloned().collect()
    }

    pub fn violations_by_type(&self, violation_type: ViolationType) -> Vec<SecurityViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.violation_type == violation_type)
            .cloned()
            .collect()
    }

    pub fn violation_count(&self) -> usize {
        self.violations.lock().len()
    }

    pub fn clear_violations(&self) {
        self.violations.lock().clear();
    }

    pub fn violation_stats(&self) -> ViolationStats {
        let violations = self.violations.lock();
        let mut stats = ViolationStats {
            total: violations.len(),
            ..Default::default()
        };
        for v in violations.iter() {
            if v.enforced {
                stats.enforced += 1;
            } else {
                stats.not_enforced += 1;
            }
            *stats.by_type.entry(v.violation_type.to_string()).or_default() += 1;
            *stats.by_severity.entry(v.severity.to_string()).or_default() += 1;
            if v.severity == Severity::Critical {
                stats.critical += 1;
            }
        }
        stats
    }

    /// Human-readable summary with the ten most violated plugins.
    pub fn security_report(&self) -> String {
        let stats = self.violation_stats();
        let policy_count = self.policy_count();

        let mut per_plugin: HashMap<String, usize> = HashMap::new();
        for v in self.violations.lock().iter() {
            *per_plugin.entry(v.plugin_id.clone()).or_default() += 1;
        }
        let mut ranked: Vec<(String, usize)> = per_plugin.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(10);

        let mut report = String::from("=== Sandbox Security Report ===\n");
        report.push_str(&format!("Generated: {}\n\n", Utc::now().to_rfc3339()));
        report.push_str(&format!("Active Policies: {}\n\n", policy_count));
        report.push_str("--- Violations ---\n");
        report.push_str(&format!("Total: {}\n", stats.total));
        report.push_str(&format!("Enforced: {}\n", stats.enforced));
        report.push_str(&format!("Not Enforced: {}\n", stats.not_enforced));
        report.push_str(&format!("Critical: {}\n\n", stats.critical));
        report.push_str("--- Most Violated Plugins (Top 10) ---\n");
        for (i, (id, count)) in ranked.iter().enumerate() {
            report.push_str(&format!("{}. {}: {} violations\n", i + 1, id, count));
        }
        report
    }
}
