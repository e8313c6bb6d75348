//! Runtime configuration
//!
//! Configuration is read from `~/.plugin-runtime/config.json` when it exists
//! and falls back to defaults otherwise. After the file is read, a `.env` file
//! is loaded and `PLUGIN_RUNTIME_*` environment variables override individual
//! fields:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `PLUGIN_RUNTIME_PLUGIN_DIR` | `plugin_dir` |
//! | `PLUGIN_RUNTIME_MAX_PLUGINS` | `max_plugins` |
//! | `PLUGIN_RUNTIME_EXECUTION_TIMEOUT_SECS` | `execution_timeout_secs` |
//! | `PLUGIN_RUNTIME_HOST_VERSION` | `host_version` |
//! | `PLUGIN_RUNTIME_SANDBOX_ENABLED` | `sandbox.enabled` |
//! | `PLUGIN_RUNTIME_REQUIRE_SIGNATURES` | `security.require_signatures` |
//! | `PLUGIN_RUNTIME_KEY_BITS` | `security.key_bits` |
//!
//! # Example config.json
//!
//! ```json
//! {
//!   "plugin_dir": "/srv/host/plugins",
//!   "max_plugins": 20,
//!   "default_permissions": ["read_save", "ui_display", "execute"],
//!   "security": { "require_signatures": false },
//!   "reload": { "debounce_ms": 250 }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};
use crate::plugins::types::permissions;
use crate::plugins::version::Version;
use crate::security::sandbox::IsolationLevel;

const ENV_PREFIX: &str = "PLUGIN_RUNTIME_";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Defaults applied to the sandbox policy of every newly loaded plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// When false, no policies are applied and no permission checks run.
    pub enabled: bool,
    pub violation_capacity: usize,
    pub default_max_memory_mb: u64,
    pub default_max_cpu_percent: u32,
    pub default_isolation: IsolationLevel,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            violation_capacity: 10_000,
            default_max_memory_mb: 100,
            default_max_cpu_percent: 50,
            default_isolation: IsolationLevel::Basic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Refuse to load plugins without a valid signature.
    pub require_signatures: bool,
    /// RSA modulus size of the runtime key pair.
    pub key_bits: usize,
    /// Name recorded as `signed_by` on signatures this runtime issues.
    pub signer: String,
    pub event_capacity: usize,
    pub signature_validity_days: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_signatures: true,
            key_bits: 2048,
            signer: "plugin-runtime".to_string(),
            event_capacity: 10_000,
            signature_validity_days: 365,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Executions kept per plugin.
    pub history_len: usize,
    /// Fraction of executions (0.0 - 1.0) that produce a performance sample.
    pub sampling_rate: f64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            history_len: 1_000,
            sampling_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub capacity: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Quiet period after the last file event before a reload starts.
    pub debounce_ms: u64,
    pub history_len: usize,
    /// How many more permissions a reloaded plugin may declare.
    pub max_permission_growth: usize,
    /// Execution records carried in a reload snapshot.
    pub snapshot_executions: usize,
    /// Watch newly loaded plugins automatically while hot reload is on.
    pub auto_watch: bool,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            history_len: 100,
            max_permission_growth: 5,
            snapshot_executions: 10,
            auto_watch: true,
        }
    }
}

impl ReloadConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// Top-level configuration of the plugin runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub plugin_dir: PathBuf,
    /// Recognised plugin file extensions, with or without the leading dot.
    pub extensions: Vec<String>,
    pub max_plugins: usize,
    pub max_file_size: u64,
    pub execution_timeout_secs: u64,
    /// Execution records kept per plugin.
    pub execution_history_len: usize,
    /// Allow-list of the default sandbox policy.
    pub default_permissions: Vec<String>,
    /// Version of the host, checked against plugin compatibility ranges.
    pub host_version: String,
    pub sandbox: SandboxConfig,
    pub security: SecurityConfig,
    pub audit: AuditConfig,
    pub profiler: ProfilerConfig,
    pub analytics: AnalyticsConfig,
    pub reload: ReloadConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugin_dir: Self::dir().join("plugins"),
            extensions: vec![".lua".to_string()],
            max_plugins: 50,
            max_file_size: 10 * 1024 * 1024,
            execution_timeout_secs: 30,
            execution_history_len: 100,
            default_permissions: vec![
                permissions::READ_SAVE.to_string(),
                permissions::UI_DISPLAY.to_string(),
                permissions::EXECUTE.to_string(),
            ],
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            sandbox: SandboxConfig::default(),
            security: SecurityConfig::default(),
            audit: AuditConfig::default(),
            profiler: ProfilerConfig::default(),
            analytics: AnalyticsConfig::default(),
            reload: ReloadConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Base directory for runtime state (`~/.plugin-runtime`).
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".plugin-runtime")
    }

    /// Default config file path.
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from the default path, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        let _ = dotenvy::dotenv();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a specific config file without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PLUGIN_RUNTIME_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_var("PLUGIN_DIR") {
            self.plugin_dir = PathBuf::from(dir);
        }
        override_parsed("MAX_PLUGINS", &mut self.max_plugins);
        override_parsed("EXECUTION_TIMEOUT_SECS", &mut self.execution_timeout_secs);
        if let Some(version) = env_var("HOST_VERSION") {
            self.host_version = version;
        }
        override_parsed("SANDBOX_ENABLED", &mut self.sandbox.enabled);
        override_parsed("REQUIRE_SIGNATURES", &mut self.security.require_signatures);
        override_parsed("KEY_BITS", &mut self.security.key_bits);
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.max_plugins == 0 {
            return Err(RuntimeError::Config(
                "max_plugins must be greater than zero".to_string(),
            ));
        }
        if self.extensions.is_empty() {
            return Err(RuntimeError::Config(
                "at least one plugin extension is required".to_string(),
            ));
        }
        if self.security.key_bits < 1024 {
            return Err(RuntimeError::Config(format!(
                "key_bits must be at least 1024, got {}",
                self.security.key_bits
            )));
        }
        if self.sandbox.default_max_cpu_percent > 100 {
            return Err(RuntimeError::Config(
                "default_max_cpu_percent cannot exceed 100".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.profiler.sampling_rate) {
            return Err(RuntimeError::Config(
                "profiler.sampling_rate must be between 0 and 1".to_string(),
            ));
        }
        self.host_version.parse::<Version>().map_err(|e| {
            RuntimeError::Config(format!("host_version is not a valid version: {}", e))
        })?;
        Ok(())
    }

    /// Default execution deadline. `0` disables the deadline.
    pub fn execution_timeout(&self) -> Option<Duration> {
        (self.execution_timeout_secs > 0).then(|| Duration::from_secs(self.execution_timeout_secs))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn override_parsed<T: FromStr>(name: &str, slot: &mut T) {
    if let Some(raw) = env_var(name) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(
                variable = %format!("{}{}", ENV_PREFIX, name),
                value = %raw,
                "Ignoring unparseable environment override"
            ),
        }
    }
}
