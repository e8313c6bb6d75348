//! Plugin Manager
//!
//! The `PluginManager` is the single entry point the host application talks
//! to. It owns the registry and wires every other component into the plugin
//! lifecycle:
//!
//! - **load**: signature check, engine creation, `load` hook, registration,
//!   dependency graph, default sandbox policy, audit and analytics
//! - **execute**: `execute` permission check, time-boxed run, then audit,
//!   profiler, analytics and the post-run sandbox checks
//! - **unload**: `unload` hook, then removal from every index
//!
//! Each component keeps its own lock. The manager never holds one while
//! calling into another component or awaiting a plugin, and hands out clones
//! instead of references.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::hooks::{EngineFactory, ExecutionOutput, Hook};
use crate::reload::{HotReloadController, PluginState, ReloadEvent, ReloadSnapshot, ReloadTarget};
use crate::security::sandbox::{SandboxManager, SandboxPolicy, Verdict};
use crate::security::signature::{PluginSignature, SignatureVerifier};
use crate::utils::analytics::Analytics;
use crate::utils::profiler::Profiler;

use super::loader::PluginLoader;
use super::registry::{PluginRegistry, RegistryEntry};
use super::resolver::{ConflictInfo, DependencyResolver};
use super::types::{permissions, ExecutionRecord, ExecutionStatus, Plugin, PluginConfig};
use super::version::Version;

/// Outcome of delivering one hook to every subscriber.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HookDispatch {
    /// Plugins whose handler returned successfully.
    pub invoked: Vec<String>,
    /// Plugin ID and error text of every failed handler.
    pub failed: Vec<(String, String)>,
}

/// Outcome of loading every plugin in the plugin directory.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(PathBuf, RuntimeError)>,
}

/// Read-only counters for host UIs and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStats {
    pub total_plugins: usize,
    pub enabled_plugins: usize,
    pub max_plugins: usize,
    pub execution_log_size: usize,
    pub sandbox_policies: usize,
    pub sandbox_violations: usize,
    pub audit_events: usize,
    pub signatures: usize,
    pub watched_plugins: usize,
    pub hot_reload_running: bool,
}

/// Orchestrates the plugin lifecycle.
pub struct PluginManager {
    config: RuntimeConfig,
    host_version: Version,
    loader: PluginLoader,
    engines: Arc<dyn EngineFactory>,
    registry: RwLock<PluginRegistry>,
    resolver: DependencyResolver,
    sandbox: SandboxManager,
    verifier: SignatureVerifier,
    audit: AuditLogger,
    profiler: Profiler,
    analytics: Analytics,
    /// Per-plugin execution records, oldest first.
    executions: Mutex<HashMap<String, VecDeque<ExecutionRecord>>>,
    reload: Arc<HotReloadController>,
    /// Held across a whole admission so the capacity check cannot race.
    admission: tokio::sync::Mutex<()>,
}

impl PluginManager {
    /// Build a manager and generate its signing key pair.
    pub fn new(config: RuntimeConfig, engines: Arc<dyn EngineFactory>) -> Result<Arc<Self>> {
        config.validate()?;
        let host_version: Version = config.host_version.parse()?;

        let verifier = SignatureVerifier::new(&config.security);
        verifier.generate_key_pair()?;

        let manager = Arc::new_cyclic(|weak: &Weak<PluginManager>| {
            let target: Weak<dyn ReloadTarget> = weak.clone();
            PluginManager {
                host_version,
                loader: PluginLoader::from_config(&config),
                engines,
                registry: RwLock::new(PluginRegistry::new()),
                resolver: DependencyResolver::new(),
                sandbox: SandboxManager::new(config.sandbox.violation_capacity),
                verifier,
                audit: AuditLogger::new(config.audit.capacity),
                profiler: Profiler::new(config.profiler.history_len, config.profiler.sampling_rate),
                analytics: Analytics::new(config.analytics.capacity),
                executions: Mutex::new(HashMap::new()),
                reload: Arc::new(HotReloadController::new(target, config.reload.clone())),
                admission: tokio::sync::Mutex::new(()),
                config,
            }
        });

        info!(
            plugin_dir = %manager.config.plugin_dir.display(),
            max_plugins = manager.config.max_plugins,
            host_version = %manager.host_version,
            "Plugin manager initialized"
        );
        Ok(manager)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn sandbox(&self) -> &SandboxManager {
        &self.sandbox
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn analytics(&self) -> &Analytics {
        &self.analytics
    }

    pub fn hot_reload(&self) -> &Arc<HotReloadController> {
        &self.reload
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Load the plugin file at `path`.
    ///
    /// While hot reload runs with `auto_watch` on, the file is watched too.
    pub async fn load_plugin(&self, path: &Path) -> Result<Plugin> {
        let plugin = {
            let _admission = self.admission.lock().await;
            self.admit(path).await?
        };

        if self.config.reload.auto_watch && self.reload.is_running() {
            if let Err(e) = self.reload.watch_plugin(&plugin.id, &plugin.path) {
                warn!(plugin = %plugin.id, error = %e, "Failed to watch plugin file");
            }
        }
        Ok(plugin)
    }

    /// Load every plugin file in the plugin directory. Failures are collected,
    /// not returned.
    pub async fn load_all(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for path in self.loader.discover_plugins()? {
            match self.load_plugin(&path).await {
                Ok(plugin) => report.loaded.push(plugin.id),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping plugin");
                    report.failed.push((path, e));
                }
            }
        }
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Loaded plugins from directory"
        );
        Ok(report)
    }

    /// Admission pipeline shared by `load_plugin` and hot reload. Callers hold
    /// the admission lock.
    async fn admit(&self, path: &Path) -> Result<Plugin> {
        let loaded = self.loader.load_plugin(path)?;
        let id = loaded.metadata.id.clone();

        {
            let registry = self.registry.read();
            if registry.contains(&id) {
                return Err(RuntimeError::PluginAlreadyLoaded(id));
            }
            if registry.plugin_count() >= self.config.max_plugins {
                return Err(RuntimeError::MaxPluginsExceeded(self.config.max_plugins));
            }
        }

        loaded.metadata.check_host_compatibility(&self.host_version)?;

        if self.config.security.require_signatures {
            if let Err(source) = self.verifier.verify_plugin(&id, path) {
                self.audit
                    .log_security_violation(&id, "signature", &source.to_string());
                return Err(RuntimeError::Signature { plugin: id, source });
            }
        }

        let engine = self.engines.create(&loaded.metadata, path, &loaded.source)?;
        let plugin = Plugin::new(loaded.metadata, path.to_path_buf(), engine);

        if let Err(e) = plugin.load().await {
            self.audit.log_error(&id, &e.to_string());
            self.analytics.record_error(&id, &e.to_string());
            return Err(e);
        }

        self.resolver.add_plugin(&plugin)?;
        let config = PluginConfig::from_metadata(&plugin.metadata);
        if let Err(e) = self.registry.write().register(plugin.clone(), config) {
            self.resolver.remove_plugin(&id);
            return Err(e);
        }

        if let Err(conflict) = self.resolver.resolve_dependencies(&id) {
            warn!(plugin = %id, error = %conflict, "Plugin has unresolved dependencies");
        }

        if self.config.sandbox.enabled {
            self.sandbox.set_policy(self.default_policy(&id))?;
        }

        self.audit.log_plugin_load(&id, &plugin.version);
        self.analytics.record_load(&id);
        info!(plugin = %id, version = %plugin.version, path = %path.display(), "Plugin loaded");
        Ok(plugin)
    }

    fn default_policy(&self, plugin_id: &str) -> SandboxPolicy {
        let sandbox = &self.config.sandbox;
        SandboxPolicy::new(plugin_id)
            .with_allowed(self.config.default_permissions.iter().cloned())
            .with_limits(
                sandbox.default_max_memory_mb,
                sandbox.default_max_cpu_percent,
                self.config.execution_timeout_secs,
            )
            .with_isolation(sandbox.default_isolation)
    }

    // -----------------------------------------------------------------------
    // Unloading
    // -----------------------------------------------------------------------

    /// Run the unload hook and remove the plugin from every index.
    ///
    /// A failing unload hook is logged; the plugin is removed regardless.
    pub async fn unload_plugin(&self, id: &str) -> Result<()> {
        self.detach(id).await?;
        self.executions.lock().remove(id);
        if self.reload.is_watched(id) {
            self.reload.unwatch_plugin(id)?;
        }
        Ok(())
    }

    /// Unload every plugin, in ID order.
    pub async fn unload_all(&self) {
        let ids: Vec<String> = self
            .registry
            .read()
            .plugins()
            .into_iter()
            .map(|p| p.id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.unload_plugin(&id).await {
                warn!(plugin = %id, error = %e, "Failed to unload plugin");
            }
        }
    }

    async fn detach(&self, id: &str) -> Result<()> {
        let plugin = self
            .registry
            .read()
            .get_plugin(id)
            .cloned()
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;

        if let Err(e) = plugin.unload().await {
            warn!(plugin = %id, error = %e, "Unload hook failed");
            self.audit.log_error(id, &e.to_string());
        }

        self.forget(id);
        self.audit.log_plugin_unload(id);
        self.analytics.record_unload(id);

        let dependents = self.resolver.get_dependents(id);
        if !dependents.is_empty() {
            warn!(plugin = %id, ?dependents, "Unloaded a plugin other plugins depend on");
        }
        info!(plugin = %id, "Plugin unloaded");
        Ok(())
    }

    /// Drop the plugin from registry, dependency graph and sandbox.
    fn forget(&self, id: &str) {
        self.registry.write().remove(id);
        self.resolver.remove_plugin(id);
        if self.sandbox.get_policy(id).is_some() {
            if let Err(e) = self.sandbox.remove_policy(id) {
                debug!(plugin = %id, error = %e, "No policy to remove");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run a plugin's body.
    ///
    /// The `execute` permission is checked first. The run is bounded by the
    /// plugin's policy timeout, or the configured default when it has none.
    /// The deadline does not preempt blocking code: it only stops waiting.
    pub async fn execute_plugin(&self, id: &str, input: Value) -> Result<ExecutionOutput> {
        let plugin = self
            .registry
            .read()
            .get_plugin(id)
            .cloned()
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        if !plugin.enabled {
            return Err(RuntimeError::PluginDisabled(id.to_string()));
        }

        if self.config.sandbox.enabled {
            match self.sandbox.check_permission(id, permissions::EXECUTE) {
                Verdict::Allow => self.audit.log_permission_used(id, permissions::EXECUTE),
                Verdict::Deny(reason) => {
                    self.audit
                        .log_permission_denied(id, permissions::EXECUTE, &reason);
                    return Err(RuntimeError::PermissionDenied {
                        plugin: id.to_string(),
                        reason,
                    });
                }
            }
        }

        let timeout = self
            .sandbox
            .get_policy(id)
            .filter(|p| p.is_active && p.timeout_seconds > 0)
            .map(|p| std::time::Duration::from_secs(p.timeout_seconds))
            .or_else(|| self.config.execution_timeout());

        let started_at = Utc::now();
        let start = Instant::now();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, plugin.execute(input)).await {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::ExecutionTimeout {
                    plugin: id.to_string(),
                    timeout: limit,
                }),
            },
            None => plugin.execute(input).await,
        };
        let duration = start.elapsed();

        let (status, error) = match &outcome {
            Ok(_) => (ExecutionStatus::Success, None),
            Err(e @ RuntimeError::ExecutionTimeout { .. }) => {
                (ExecutionStatus::Timeout, Some(e.to_string()))
            }
            Err(e) => (ExecutionStatus::Error, Some(e.to_string())),
        };
        let memory_bytes = outcome.as_ref().ok().and_then(|o| o.memory_bytes);

        self.push_execution(ExecutionRecord {
            plugin_id: plugin.id.clone(),
            plugin_name: plugin.name.clone(),
            plugin_version: plugin.version.clone(),
            started_at,
            duration,
            status,
            error: error.clone(),
        });
        self.audit
            .log_execution(id, duration, status, error.as_deref());
        self.profiler
            .record_execution(id, duration, status, error.as_deref(), memory_bytes);
        self.analytics
            .record_execution(id, duration, status, error.as_deref());

        if let Verdict::Deny(reason) = self.sandbox.verify_execution_time(id, duration) {
            self.audit.log_security_violation(id, "timeout", &reason);
        }
        if let Some(bytes) = memory_bytes {
            if let Verdict::Deny(reason) = self.sandbox.verify_memory_usage(id, bytes) {
                self.audit
                    .log_security_violation(id, "memory_exceeded", &reason);
            }
        }

        match &outcome {
            Ok(_) => debug!(plugin = %id, duration_ms = duration.as_millis() as u64, "Plugin executed"),
            Err(e) => warn!(plugin = %id, status = %status, error = %e, "Plugin execution failed"),
        }
        outcome
    }

    fn push_execution(&self, record: ExecutionRecord) {
        let limit = self.config.execution_history_len.max(1);
        let mut executions = self.executions.lock();
        let log = executions.entry(record.plugin_id.clone()).or_default();
        if log.len() >= limit {
            log.pop_front();
        }
        log.push_back(record);
    }

    /// Execution history of a plugin, newest first.
    pub fn execution_log(&self, id: &str) -> Vec<ExecutionRecord> {
        self.executions
            .lock()
            .get(id)
            .map(|log| log.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver `hook` to every enabled plugin subscribed to it.
    ///
    /// Handlers run concurrently. A failing handler is logged and reported
    /// in the result; it never stops the others.
    pub async fn call_hook(&self, hook: &Hook) -> HookDispatch {
        let hook_type = hook.hook_type();
        let subscribers: Vec<Plugin> = self
            .registry
            .read()
            .subscribers(hook_type)
            .into_iter()
            .cloned()
            .collect();

        let results = join_all(subscribers.iter().map(|plugin| async move {
            (plugin.id.clone(), plugin.call_hook(hook).await)
        }))
        .await;

        let mut dispatch = HookDispatch::default();
        for (id, result) in results {
            match result {
                Ok(()) => dispatch.invoked.push(id),
                Err(e) => {
                    warn!(plugin = %id, hook = %hook_type, error = %e, "Hook handler failed");
                    self.audit.log_error(&id, &e.to_string());
                    self.analytics.record_error(&id, &e.to_string());
                    dispatch.failed.push((id, e.to_string()));
                }
            }
        }
        debug!(
            hook = %hook_type,
            invoked = dispatch.invoked.len(),
            failed = dispatch.failed.len(),
            "Hook dispatched"
        );
        dispatch
    }

    // -----------------------------------------------------------------------
    // Registry access
    // -----------------------------------------------------------------------

    pub fn enable_plugin(&self, id: &str) -> Result<()> {
        self.registry.write().set_enabled(id, true)?;
        info!(plugin = %id, "Plugin enabled");
        Ok(())
    }

    pub fn disable_plugin(&self, id: &str) -> Result<()> {
        self.registry.write().set_enabled(id, false)?;
        info!(plugin = %id, "Plugin disabled");
        Ok(())
    }

    pub fn get_plugin(&self, id: &str) -> Option<Plugin> {
        self.registry.read().get_plugin(id).cloned()
    }

    /// All loaded plugins, sorted by ID.
    pub fn list_plugins(&self) -> Vec<Plugin> {
        self.registry.read().plugins().into_iter().cloned().collect()
    }

    pub fn plugin_count(&self) -> usize {
        self.registry.read().plugin_count()
    }

    pub fn get_plugin_config(&self, id: &str) -> Option<PluginConfig> {
        self.registry.read().get(id).map(|e| e.config.clone())
    }

    /// Replace a plugin's configuration. The enabled flag follows the config.
    pub fn set_plugin_config(&self, id: &str, config: PluginConfig) -> Result<()> {
        config.validate()?;
        let mut registry = self.registry.write();
        let entry = registry
            .get_mut(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        entry.plugin.enabled = config.enabled;
        entry.config = config;
        Ok(())
    }

    pub fn set_plugin_data(&self, id: &str, key: &str, value: Value) -> Result<()> {
        let mut registry = self.registry.write();
        let entry = registry
            .get_mut(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        entry.data.insert(key.to_string(), value);
        Ok(())
    }

    pub fn plugin_data(&self, id: &str) -> Option<HashMap<String, Value>> {
        self.registry.read().get(id).map(|e| e.data.clone())
    }

    pub fn stats(&self) -> ManagerStats {
        let (total_plugins, enabled_plugins) = {
            let registry = self.registry.read();
            (registry.plugin_count(), registry.enabled_count())
        };
        let execution_log_size = self.executions.lock().values().map(VecDeque::len).sum();

        ManagerStats {
            total_plugins,
            enabled_plugins,
            max_plugins: self.config.max_plugins,
            execution_log_size,
            sandbox_policies: self.sandbox.policy_count(),
            sandbox_violations: self.sandbox.violation_count(),
            audit_events: self.audit.count(),
            signatures: self.verifier.signatures().len(),
            watched_plugins: self.reload.watched_plugins().len(),
            hot_reload_running: self.reload.is_running(),
        }
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    /// Conflicts across every loaded plugin, using registered versions.
    pub fn detect_dependency_conflicts(&self) -> Vec<ConflictInfo> {
        let installed: HashMap<String, String> = self
            .registry
            .read()
            .plugins()
            .into_iter()
            .map(|p| (p.id.clone(), p.version.clone()))
            .collect();
        self.resolver.detect_conflicts(&installed)
    }

    pub fn resolve_plugin_dependencies(&self, id: &str) -> Result<BTreeMap<String, String>> {
        self.resolver.resolve_dependencies(id)
    }

    pub fn dependency_graph_dot(&self) -> String {
        self.resolver.generate_dot_graph()
    }

    // -----------------------------------------------------------------------
    // Signatures
    // -----------------------------------------------------------------------

    pub fn sign_plugin(&self, id: &str, path: &Path) -> Result<PluginSignature> {
        self.verifier.sign_plugin(id, path)
    }

    // -----------------------------------------------------------------------
    // Hot reload
    // -----------------------------------------------------------------------

    /// Start the file watcher and watch every loaded plugin.
    pub fn enable_hot_reload(&self) -> Result<()> {
        self.reload.enable()?;
        for plugin in self.list_plugins() {
            if let Err(e) = self.reload.watch_plugin(&plugin.id, &plugin.path) {
                warn!(plugin = %plugin.id, error = %e, "Failed to watch plugin file");
            }
        }
        Ok(())
    }

    pub fn disable_hot_reload(&self) -> Result<()> {
        self.reload.disable()
    }

    pub async fn reload_plugin(&self, id: &str) -> Result<ReloadEvent> {
        self.reload.reload_plugin(id).await
    }

    /// Most recent reload attempts, newest first. `limit` 0 returns all.
    pub fn reload_history(&self, limit: usize) -> Vec<ReloadEvent> {
        self.reload.history(limit)
    }

    /// Stop hot reload and unload every plugin.
    pub async fn shutdown(&self) {
        self.reload.stop();
        self.unload_all().await;
        info!("Plugin manager shut down");
    }
}

#[async_trait]
impl ReloadTarget for PluginManager {
    async fn snapshot(&self, plugin_id: &str, executions: usize) -> Result<ReloadSnapshot> {
        let entry = self
            .registry
            .read()
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;

        let last_executions: Vec<ExecutionRecord> = self
            .execution_log(plugin_id)
            .into_iter()
            .take(executions)
            .collect();

        let state = PluginState {
            plugin_id: entry.plugin.id.clone(),
            version: entry.plugin.version.clone(),
            timestamp: Utc::now(),
            enabled: entry.plugin.enabled,
            config: Some(entry.config),
            data: entry.data,
            last_executions,
        };
        state.validate()?;

        Ok(ReloadSnapshot {
            state,
            plugin: entry.plugin,
            policy: self.sandbox.get_policy(plugin_id),
        })
    }

    async fn unload_for_reload(&self, plugin_id: &str) -> Result<()> {
        self.detach(plugin_id).await
    }

    async fn load_for_reload(&self, path: &Path) -> Result<Plugin> {
        let _admission = self.admission.lock().await;
        self.admit(path).await
    }

    async fn restore(&self, plugin_id: &str, snapshot: &ReloadSnapshot) -> Result<()> {
        {
            let mut registry = self.registry.write();
            let entry = registry
                .get_mut(plugin_id)
                .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;
            entry.plugin.enabled = snapshot.state.enabled;
            entry.config.enabled = snapshot.state.enabled;
            if let Some(old) = &snapshot.state.config {
                entry.config.settings = old.settings.clone();
            }
            entry.data = snapshot.state.data.clone();
        }

        if let Some(policy) = &snapshot.policy {
            self.sandbox.set_policy(policy.clone())?;
            if !policy.is_active {
                self.sandbox.set_policy_active(plugin_id, false)?;
            }
        }
        Ok(())
    }

    async fn reinstate(&self, snapshot: &ReloadSnapshot) -> Result<()> {
        let id = snapshot.plugin.id.as_str();
        self.forget(id);

        snapshot.plugin.load().await?;

        let mut plugin = snapshot.plugin.clone();
        plugin.enabled = snapshot.state.enabled;
        let config = snapshot
            .state
            .config
            .clone()
            .unwrap_or_else(|| PluginConfig::from_metadata(&plugin.metadata));

        self.resolver.add_plugin(&plugin)?;
        self.registry.write().restore(RegistryEntry {
            plugin,
            config,
            data: snapshot.state.data.clone(),
        });

        if let Some(policy) = &snapshot.policy {
            self.sandbox.set_policy(policy.clone())?;
            if !policy.is_active {
                self.sandbox.set_policy_active(id, false)?;
            }
        }
        info!(plugin = %id, version = %snapshot.state.version, "Previous plugin instance reinstated");
        Ok(())
    }

    fn reload_finished(&self, event: &ReloadEvent) {
        self.audit
            .log_reload(&event.plugin_id, event.status.as_str(), event.error.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEventType;
    use crate::config::SecurityConfig;
    use crate::hooks::{MockPluginEngine, NoopEngine, NoopEngineFactory, PluginEngine};
    use crate::plugins::resolver::ConflictType;
    use crate::plugins::types::PluginMetadata;
    use crate::reload::ReloadStatus;
    use crate::security::signature::SignatureError;
    use serde_json::json;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> RuntimeConfig {
        RuntimeConfig {
            plugin_dir: dir.to_path_buf(),
            security: SecurityConfig {
                require_signatures: false,
                key_bits: 1024,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn write_plugin(dir: &Path, id: &str, version: &str, extra: &str) -> PathBuf {
        let path = dir.join(format!("{}.lua", id));
        let source = format!(
            "-- @id {id}\n-- @name {id}\n-- @version {version}\n-- @author tester\n{extra}\nreturn {{}}\n"
        );
        fs::write(&path, source).unwrap();
        path
    }

    fn manager(dir: &Path) -> Arc<PluginManager> {
        PluginManager::new(test_config(dir), Arc::new(NoopEngineFactory)).unwrap()
    }

    /// Hands out a fixed engine for selected plugin IDs.
    #[derive(Default)]
    struct TestFactory {
        engines: HashMap<String, Arc<dyn PluginEngine>>,
    }

    impl EngineFactory for TestFactory {
        fn create(
            &self,
            metadata: &PluginMetadata,
            _path: &Path,
            _source: &str,
        ) -> Result<Arc<dyn PluginEngine>> {
            Ok(self
                .engines
                .get(&metadata.id)
                .cloned()
                .unwrap_or_else(|| Arc::new(NoopEngine)))
        }
    }

    struct SlowEngine;

    #[async_trait]
    impl PluginEngine for SlowEngine {
        async fn call_hook(&self, _hook: &Hook) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, _input: Value) -> Result<ExecutionOutput> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ExecutionOutput::default())
        }
    }

    #[tokio::test]
    async fn test_load_registers_everywhere() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "alpha", "1.0.0", "-- @permissions read_save");
        let manager = manager(dir.path());

        let plugin = manager.load_plugin(&path).await.unwrap();
        assert_eq!(plugin.id, "alpha");
        assert!(plugin.enabled);
        assert_eq!(manager.plugin_count(), 1);

        let policy = manager.sandbox().get_policy("alpha").unwrap();
        assert_eq!(policy.allowed_permissions, manager.config().default_permissions);
        assert_eq!(manager.audit().by_type(AuditEventType::Load).len(), 1);
        assert_eq!(manager.analytics().usage("alpha").unwrap().load_count, 1);
        assert!(manager.dependency_graph_dot().contains("alpha"));
    }

    #[tokio::test]
    async fn test_duplicate_and_capacity() {
        let dir = TempDir::new().unwrap();
        let a = write_plugin(dir.path(), "a", "1.0.0", "");
        let b = write_plugin(dir.path(), "b", "1.0.0", "");
        let config = RuntimeConfig {
            max_plugins: 1,
            ..test_config(dir.path())
        };
        let manager = PluginManager::new(config, Arc::new(NoopEngineFactory)).unwrap();

        manager.load_plugin(&a).await.unwrap();
        assert!(matches!(
            manager.load_plugin(&a).await,
            Err(RuntimeError::PluginAlreadyLoaded(_))
        ));
        assert!(matches!(
            manager.load_plugin(&b).await,
            Err(RuntimeError::MaxPluginsExceeded(1))
        ));
    }

    #[tokio::test]
    async fn test_incompatible_host_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "future", "1.0.0", "-- @min_app_version 99.0.0");
        let manager = manager(dir.path());
        assert!(matches!(
            manager.load_plugin(&path).await,
            Err(RuntimeError::Incompatible { .. })
        ));
        assert_eq!(manager.plugin_count(), 0);
    }

    #[tokio::test]
    async fn test_signature_required() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "signed", "1.0.0", "");
        let mut config = test_config(dir.path());
        config.security.require_signatures = true;
        let manager = PluginManager::new(config, Arc::new(NoopEngineFactory)).unwrap();

        let err = manager.load_plugin(&path).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Signature {
                source: SignatureError::Missing,
                ..
            }
        ));
        assert_eq!(
            manager.audit().by_type(AuditEventType::SecurityViolation).len(),
            1
        );

        manager.sign_plugin("signed", &path).unwrap();
        assert!(manager.load_plugin(&path).await.is_ok());
    }

    #[tokio::test]
    async fn test_tampered_plugin_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "signed", "1.0.0", "");
        let mut config = test_config(dir.path());
        config.security.require_signatures = true;
        let manager = PluginManager::new(config, Arc::new(NoopEngineFactory)).unwrap();

        manager.sign_plugin("signed", &path).unwrap();
        write_plugin(dir.path(), "signed", "1.0.0", "-- tampered");

        let err = manager.load_plugin(&path).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Signature {
                source: SignatureError::HashMismatch,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unload_removes_from_all_indexes() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "gone", "1.0.0", "");
        let manager = manager(dir.path());
        manager.load_plugin(&path).await.unwrap();
        manager.execute_plugin("gone", json!({})).await.unwrap();

        manager.unload_plugin("gone").await.unwrap();
        assert!(manager.get_plugin("gone").is_none());
        assert!(manager.sandbox().get_policy("gone").is_none());
        assert!(manager.execution_log("gone").is_empty());
        assert!(!manager.dependency_graph_dot().contains("\"gone\""));
        assert_eq!(manager.audit().by_type(AuditEventType::Unload).len(), 1);

        assert!(matches!(
            manager.unload_plugin("gone").await,
            Err(RuntimeError::PluginNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_records_everywhere() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "runner", "1.2.0", "");
        let manager = manager(dir.path());
        manager.load_plugin(&path).await.unwrap();

        manager.execute_plugin("runner", json!({"x": 1})).await.unwrap();
        manager.execute_plugin("runner", json!({"x": 2})).await.unwrap();

        let log = manager.execution_log("runner");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].plugin_version, "1.2.0");
        assert_eq!(log[0].status, ExecutionStatus::Success);

        assert_eq!(manager.profiler().aggregate("runner").unwrap().execution_count, 2);
        assert_eq!(manager.analytics().usage("runner").unwrap().execution_count, 2);
        assert_eq!(manager.audit().by_type(AuditEventType::Execute).len(), 2);
        assert_eq!(manager.audit().permission_usage()["execute"], 2);
    }

    #[tokio::test]
    async fn test_execute_denied_without_permission() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "locked", "1.0.0", "");
        let manager = manager(dir.path());
        manager.load_plugin(&path).await.unwrap();
        manager
            .sandbox()
            .deny_permission("locked", permissions::EXECUTE)
            .unwrap();

        let err = manager.execute_plugin("locked", json!(null)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::PermissionDenied { .. }));
        assert!(manager.execution_log("locked").is_empty());
        assert_eq!(
            manager.audit().by_type(AuditEventType::PermissionDenied).len(),
            1
        );
        assert_eq!(manager.sandbox().violation_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_disabled_plugin() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "idle", "1.0.0", "");
        let manager = manager(dir.path());
        manager.load_plugin(&path).await.unwrap();
        manager.disable_plugin("idle").unwrap();

        assert!(matches!(
            manager.execute_plugin("idle", json!(null)).await,
            Err(RuntimeError::PluginDisabled(_))
        ));
        manager.enable_plugin("idle").unwrap();
        assert!(manager.execute_plugin("idle", json!(null)).await.is_ok());
    }

    #[tokio::test]
    async fn test_execution_error_is_recorded() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "broken", "1.0.0", "");

        let mut engine = MockPluginEngine::new();
        engine.expect_call_hook().returning(|_| Ok(()));
        engine.expect_execute().returning(|_| {
            Err(RuntimeError::Execution {
                plugin: "broken".to_string(),
                message: "nil value".to_string(),
            })
        });
        let mut factory = TestFactory::default();
        factory.engines.insert("broken".to_string(), Arc::new(engine));

        let manager = PluginManager::new(test_config(dir.path()), Arc::new(factory)).unwrap();
        manager.load_plugin(&path).await.unwrap();

        let err = manager.execute_plugin("broken", json!(null)).await.unwrap_err();
        assert!(err.to_string().contains("nil value"));

        let log = manager.execution_log("broken");
        assert_eq!(log[0].status, ExecutionStatus::Error);
        assert!(log[0].error.as_deref().unwrap().contains("nil value"));
        assert_eq!(manager.profiler().aggregate("broken").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_execution_timeout_is_distinguished() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "slow", "1.0.0", "");
        let mut factory = TestFactory::default();
        factory
            .engines
            .insert("slow".to_string(), Arc::new(SlowEngine));
        let config = RuntimeConfig {
            execution_timeout_secs: 1,
            ..test_config(dir.path())
        };
        let manager = PluginManager::new(config, Arc::new(factory)).unwrap();
        manager.load_plugin(&path).await.unwrap();

        let err = manager.execute_plugin("slow", json!(null)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ExecutionTimeout { .. }));
        assert_eq!(manager.execution_log("slow")[0].status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn test_call_hook_fans_out_and_survives_failures() {
        let dir = TempDir::new().unwrap();
        let ok = write_plugin(dir.path(), "ok", "1.0.0", "-- @hooks save:save");
        let bad = write_plugin(dir.path(), "bad", "1.0.0", "-- @hooks save:save");
        let deaf = write_plugin(dir.path(), "deaf", "1.0.0", "-- @hooks sync");

        let mut engine = MockPluginEngine::new();
        engine.expect_call_hook().returning(|hook| match hook {
            Hook::SaveSave { .. } => Err(RuntimeError::Hook {
                plugin: "bad".to_string(),
                hook: "save:save".to_string(),
                message: "disk full".to_string(),
            }),
            _ => Ok(()),
        });
        let mut factory = TestFactory::default();
        factory.engines.insert("bad".to_string(), Arc::new(engine));

        let manager = PluginManager::new(test_config(dir.path()), Arc::new(factory)).unwrap();
        for path in [&ok, &bad, &deaf] {
            manager.load_plugin(path).await.unwrap();
        }

        let dispatch = manager
            .call_hook(&Hook::SaveSave {
                path: PathBuf::from("game.sav"),
            })
            .await;
        assert_eq!(dispatch.invoked, vec!["ok"]);
        assert_eq!(dispatch.failed.len(), 1);
        assert_eq!(dispatch.failed[0].0, "bad");

        manager.disable_plugin("ok").unwrap();
        let dispatch = manager
            .call_hook(&Hook::SaveSave {
                path: PathBuf::from("game.sav"),
            })
            .await;
        assert!(dispatch.invoked.is_empty());
    }

    #[tokio::test]
    async fn test_config_and_data() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "cfg", "1.0.0", "");
        let manager = manager(dir.path());
        manager.load_plugin(&path).await.unwrap();

        let mut config = manager.get_plugin_config("cfg").unwrap();
        config.settings.insert("interval".to_string(), json!(5));
        config.enabled = false;
        manager.set_plugin_config("cfg", config).unwrap();
        assert!(!manager.get_plugin("cfg").unwrap().enabled);
        assert_eq!(
            manager.get_plugin_config("cfg").unwrap().settings["interval"],
            json!(5)
        );

        let mut invalid = manager.get_plugin_config("cfg").unwrap();
        invalid.hooks = vec!["not-a-hook".to_string()];
        assert!(manager.set_plugin_config("cfg", invalid).is_err());

        manager.set_plugin_data("cfg", "count", json!(3)).unwrap();
        assert_eq!(manager.plugin_data("cfg").unwrap()["count"], json!(3));
        assert!(manager.set_plugin_data("missing", "k", json!(1)).is_err());
    }

    #[tokio::test]
    async fn test_dependencies() {
        let dir = TempDir::new().unwrap();
        let core = write_plugin(dir.path(), "core", "1.5.0", "");
        let app = write_plugin(dir.path(), "app", "1.0.0", "-- @dependencies core@^1.0");
        let orphan = write_plugin(dir.path(), "orphan", "1.0.0", "-- @dependencies ghost");
        let manager = manager(dir.path());
        for path in [&core, &app, &orphan] {
            manager.load_plugin(path).await.unwrap();
        }

        let resolved = manager.resolve_plugin_dependencies("app").unwrap();
        assert_eq!(resolved.get("core").map(String::as_str), Some("1.5.0"));

        let conflicts = manager.detect_dependency_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].dependency_id, "ghost");
        assert_eq!(conflicts[0].conflict_type, ConflictType::Missing);
    }

    #[tokio::test]
    async fn test_load_all_collects_failures() {
        let dir = TempDir::new().unwrap();
        write_plugin(dir.path(), "good", "1.0.0", "");
        fs::write(dir.path().join("bad.lua"), "-- @id bad\nreturn {}\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let manager = manager(dir.path());

        let report = manager.load_all().await.unwrap();
        assert_eq!(report.loaded, vec!["good"]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.ends_with("bad.lua"));
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "s", "1.0.0", "");
        let manager = manager(dir.path());
        manager.load_plugin(&path).await.unwrap();
        manager.execute_plugin("s", json!(null)).await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats.total_plugins, 1);
        assert_eq!(stats.enabled_plugins, 1);
        assert_eq!(stats.execution_log_size, 1);
        assert_eq!(stats.sandbox_policies, 1);
        assert!(stats.audit_events >= 3);
        assert!(!stats.hot_reload_running);
    }

    #[tokio::test]
    async fn test_reload_preserves_state() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "hot", "1.0.0", "");
        let manager = manager(dir.path());
        manager.load_plugin(&path).await.unwrap();

        let mut config = manager.get_plugin_config("hot").unwrap();
        config.settings.insert("theme".to_string(), json!("dark"));
        config.enabled = false;
        manager.set_plugin_config("hot", config).unwrap();
        manager.set_plugin_data("hot", "count", json!(7)).unwrap();

        write_plugin(dir.path(), "hot", "1.1.0", "");
        let event = manager.reload_plugin("hot").await.unwrap();
        assert_eq!(event.status, ReloadStatus::Success);
        assert_eq!(event.new_version.as_deref(), Some("1.1.0"));

        let plugin = manager.get_plugin("hot").unwrap();
        assert_eq!(plugin.version, "1.1.0");
        assert!(!plugin.enabled);
        let config = manager.get_plugin_config("hot").unwrap();
        assert_eq!(config.settings["theme"], json!("dark"));
        assert_eq!(manager.plugin_data("hot").unwrap()["count"], json!(7));
        assert_eq!(manager.audit().by_type(AuditEventType::Reload).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reload_rolls_back_version() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "hot", "1.0.0", "");
        let manager = manager(dir.path());
        manager.load_plugin(&path).await.unwrap();
        manager
            .sandbox()
            .allow_permission("hot", "write_save")
            .unwrap();

        // The file now claims a different plugin ID.
        fs::write(
            &path,
            "-- @id other\n-- @name other\n-- @version 2.0.0\n-- @author x\nreturn {}\n",
        )
        .unwrap();

        let err = manager.reload_plugin("hot").await.unwrap_err();
        assert!(matches!(err, RuntimeError::ReloadFailed { .. }));

        let plugin = manager.get_plugin("hot").unwrap();
        assert_eq!(plugin.version, "1.0.0");
        assert!(manager.get_plugin("other").is_none());
        assert!(manager
            .sandbox()
            .get_policy("hot")
            .unwrap()
            .allowed_permissions
            .contains(&"write_save".to_string()));
        assert_eq!(manager.reload_history(0)[0].status, ReloadStatus::RolledBack);
        assert_eq!(manager.plugin_count(), 1);
    }

    #[tokio::test]
    async fn test_broken_file_reload_rolls_back() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "hot", "1.0.0", "");
        let manager = manager(dir.path());
        manager.load_plugin(&path).await.unwrap();

        fs::write(&path, "-- @id hot\nreturn {}\n").unwrap();
        assert!(manager.reload_plugin("hot").await.is_err());
        assert_eq!(manager.get_plugin("hot").unwrap().version, "1.0.0");
        assert!(manager.execute_plugin("hot", json!(null)).await.is_ok());
    }

    #[tokio::test]
    async fn test_file_change_triggers_reload() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "watched", "1.0.0", "");
        let manager = manager(dir.path());
        manager.load_plugin(&path).await.unwrap();
        manager.enable_hot_reload().unwrap();
        assert!(manager.hot_reload().is_watched("watched"));

        // Give the watcher a moment to register before writing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        write_plugin(dir.path(), "watched", "1.0.1", "");

        let mut reloaded = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if manager.get_plugin("watched").map(|p| p.version) == Some("1.0.1".to_string()) {
                reloaded = true;
                break;
            }
        }
        assert!(reloaded, "plugin was not reloaded after the file changed");
        manager.disable_hot_reload().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_unloads_everything() {
        let dir = TempDir::new().unwrap();
        let a = write_plugin(dir.path(), "a", "1.0.0", "");
        let b = write_plugin(dir.path(), "b", "1.0.0", "");
        let manager = manager(dir.path());
        manager.load_plugin(&a).await.unwrap();
        manager.load_plugin(&b).await.unwrap();
        manager.enable_hot_reload().unwrap();

        manager.shutdown().await;
        assert_eq!(manager.plugin_count(), 0);
        assert!(!manager.hot_reload().is_running());
        assert!(manager.hot_reload().watched_plugins().is_empty());
    }
}
