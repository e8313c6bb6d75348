//! Hot reload of plugin code
//!
//! The [`HotReloadController`] swaps a running plugin for the code currently
//! on disk without restarting the host. A reload snapshots the plugin, unloads
//! it, loads the file again, validates the new instance and either restores the
//! transient state into it or reinstates the old instance. Every attempt ends
//! up in a bounded history, whatever its outcome.
//!
//! File changes are picked up by a `notify` watcher on the directories of the
//! watched plugin files. Events are debounced so a reload never starts while an
//! editor is still writing.
//!
//! The controller never touches the registry itself. It drives the plugin
//! manager through the [`ReloadTarget`] trait and holds it weakly, so dropping
//! the manager also stops the watcher task.

pub mod state;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ReloadConfig;
use crate::error::{Result, RuntimeError};
use crate::plugins::loader::manifest_path;
use crate::plugins::types::Plugin;
use crate::security::sandbox::SandboxPolicy;

pub use state::{PluginState, StateChange, StateDiff, StateSnapshot};

// ---------------------------------------------------------------------------
// Status and events
// ---------------------------------------------------------------------------

/// Where a plugin currently is in the reload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadStatus {
    Watching,
    Reloading,
    Success,
    RolledBack,
    Failed,
}

impl ReloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadStatus::Watching => "watching",
            ReloadStatus::Reloading => "reloading",
            ReloadStatus::Success => "success",
            ReloadStatus::RolledBack => "rolled_back",
            ReloadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reload attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadEvent {
    pub plugin_id: String,
    pub old_version: String,
    /// Version of the code that was loaded, if loading got that far.
    pub new_version: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// `Success`, `RolledBack` or `Failed`.
    pub status: ReloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: Duration,
    /// Summary of the state diff across a successful reload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<String>,
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Everything needed to put a plugin back the way it was.
#[derive(Debug, Clone)]
pub struct ReloadSnapshot {
    pub state: PluginState,
    pub plugin: Plugin,
    pub policy: Option<SandboxPolicy>,
}

/// The primitives a reload is built from. Implemented by the plugin manager.
///
/// None of these touch the watch index: the watched path stays the same
/// across a reload.
#[async_trait]
pub trait ReloadTarget: Send + Sync {
    /// Copy out the plugin and its transient state.
    async fn snapshot(&self, plugin_id: &str, executions: usize) -> Result<ReloadSnapshot>;

    /// Run the unload hook and drop the plugin from every index.
    async fn unload_for_reload(&self, plugin_id: &str) -> Result<()>;

    /// Admit the plugin at `path` again and return the new instance.
    async fn load_for_reload(&self, path: &Path) -> Result<Plugin>;

    /// Copy enabled flag, settings, data and policy into the new instance.
    async fn restore(&self, plugin_id: &str, snapshot: &ReloadSnapshot) -> Result<()>;

    /// Put the snapshotted instance back in place of whatever is registered.
    async fn reinstate(&self, snapshot: &ReloadSnapshot) -> Result<()>;

    /// Called once per attempt after it is recorded.
    fn reload_finished(&self, _event: &ReloadEvent) {}
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct WatcherHandle {
    watcher: RecommendedWatcher,
    /// Directories currently registered with the watcher.
    dirs: HashSet<PathBuf>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Watches plugin files and reloads plugins when they change.
pub struct HotReloadController {
    target: Weak<dyn ReloadTarget>,
    settings: ReloadConfig,
    /// Plugin ID -> canonical file path.
    watched: RwLock<HashMap<String, PathBuf>>,
    statuses: RwLock<HashMap<String, ReloadStatus>>,
    history: Mutex<VecDeque<ReloadEvent>>,
    watcher: Mutex<Option<WatcherHandle>>,
}

impl HotReloadController {
    pub fn new(target: Weak<dyn ReloadTarget>, settings: ReloadConfig) -> Self {
        Self {
            target,
            settings,
            watched: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            watcher: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ReloadConfig {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Watcher lifecycle
    // -----------------------------------------------------------------------

    /// Start the filesystem watcher.
    ///
    /// Must be called from within a tokio runtime. Fails if the watcher is
    /// already running.
    pub fn enable(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Err(RuntimeError::Watcher("hot reload is already running".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RuntimeError::Watcher(format!("no async runtime: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;

        let mut dirs = HashSet::new();
        for path in self.watched.read().values() {
            if let Some(dir) = path.parent() {
                if dirs.insert(dir.to_path_buf()) {
                    watcher.watch(dir, RecursiveMode::NonRecursive)?;
                }
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = runtime.spawn(run_watch_loop(
            Arc::downgrade(self),
            rx,
            stop_rx,
            self.settings.debounce(),
        ));

        info!(dirs = dirs.len(), "Hot reload enabled");
        *slot = Some(WatcherHandle {
            watcher,
            dirs,
            stop: Some(stop_tx),
            task,
        });
        Ok(())
    }

    /// Stop the filesystem watcher. Watched plugins stay in the index.
    pub fn disable(&self) -> Result<()> {
        let handle = self
            .watcher
            .lock()
            .take()
            .ok_or_else(|| RuntimeError::Watcher("hot reload is not running".into()))?;
        shutdown(handle);
        info!("Hot reload disabled");
        Ok(())
    }

    /// Stop watching and forget every watched plugin.
    pub fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            shutdown(handle);
        }
        self.watched.write().clear();
        self.statuses.write().clear();
        debug!("Hot reload controller stopped");
    }

    pub fn is_running(&self) -> bool {
        self.watcher.lock().is_some()
    }

    // -----------------------------------------------------------------------
    // Watch index
    // -----------------------------------------------------------------------

    /// Start watching `path` for changes to `plugin_id`.
    pub fn watch_plugin(&self, plugin_id: &str, path: &Path) -> Result<()> {
        let path = path.canonicalize()?;

        if let Some(handle) = self.watcher.lock().as_mut() {
            if let Some(dir) = path.parent() {
                if !handle.dirs.contains(dir) {
                    handle.watcher.watch(dir, RecursiveMode::NonRecursive)?;
                    handle.dirs.insert(dir.to_path_buf());
                }
            }
        }

        debug!(plugin = %plugin_id, path = %path.display(), "Watching plugin");
        self.watched.write().insert(plugin_id.to_string(), path);
        self.statuses
            .write()
            .insert(plugin_id.to_string(), ReloadStatus::Watching);
        Ok(())
    }

    pub fn unwatch_plugin(&self, plugin_id: &str) -> Result<()> {
        let path = self
            .watched
            .write()
            .remove(plugin_id)
            .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;
        self.statuses.write().remove(plugin_id);

        let Some(dir) = path.parent() else {
            return Ok(());
        };
        let dir_still_used = self
            .watched
            .read()
            .values()
            .any(|p| p.parent() == Some(dir));
        if !dir_still_used {
            if let Some(handle) = self.watcher.lock().as_mut() {
                if handle.dirs.remove(dir) {
                    if let Err(e) = handle.watcher.unwatch(dir) {
                        warn!(dir = %dir.display(), error = %e, "Failed to unwatch directory");
                    }
                }
            }
        }
        debug!(plugin = %plugin_id, "Stopped watching plugin");
        Ok(())
    }

    pub fn is_watched(&self, plugin_id: &str) -> bool {
        self.watched.read().contains_key(plugin_id)
    }

    /// Watched plugins and their paths, sorted by ID.
    pub fn watched_plugins(&self) -> Vec<(String, PathBuf)> {
        let mut watched: Vec<(String, PathBuf)> = self
            .watched
            .read()
            .iter()
            .map(|(id, path)| (id.clone(), path.clone()))
            .collect();
        watched.sort();
        watched
    }

    /// Plugin whose file or sidecar manifest is at `path`.
    fn plugin_for_path(&self, path: &Path) -> Option<String> {
        let canonical = path.canonicalize().ok();
        let matches =
            |candidate: &Path| candidate == path || canonical.as_deref() == Some(candidate);
        self.watched
            .read()
            .iter()
            .find(|(_, watched)| {
                matches(watched.as_path())
                    || manifest_path(watched).is_some_and(|manifest| matches(&manifest))
            })
            .map(|(id, _)| id.clone())
    }

    // -----------------------------------------------------------------------
    // Status and history
    // -----------------------------------------------------------------------

    pub fn reload_status(&self, plugin_id: &str) -> Option<ReloadStatus> {
        self.statuses.read().get(plugin_id).copied()
    }

    /// Most recent reload events, newest first. `limit` 0 returns all.
    pub fn history(&self, limit: usize) -> Vec<ReloadEvent> {
        let history = self.history.lock();
        let take = if limit == 0 { history.len() } else { limit };
        history.iter().rev().take(take).cloned().collect()
    }

    /// Reload events of one plugin, newest first.
    pub fn plugin_history(&self, plugin_id: &str, limit: usize) -> Vec<ReloadEvent> {
        let history = self.history.lock();
        let take = if limit == 0 { history.len() } else { limit };
        history
            .iter()
            .rev()
            .filter(|e| e.plugin_id == plugin_id)
            .take(take)
            .cloned()
            .collect()
    }

    fn record(&self, event: ReloadEvent) {
        let mut history = self.history.lock();
        if history.len() >= self.settings.history_len.max(1) {
            history.pop_front();
        }
        history.push_back(event);
    }

    // -----------------------------------------------------------------------
    // Reload
    // -----------------------------------------------------------------------

    /// Reject a new instance that changed identity or grew its permissions
    /// past the allowed slack.
    pub fn validate_reload(&self, old: &Plugin, new: &Plugin) -> Result<()> {
        if old.id != new.id {
            return Err(RuntimeError::ReloadValidation {
                plugin: old.id.clone(),
                reason: format!("plugin ID changed from '{}' to '{}'", old.id, new.id),
            });
        }
        let old_count = old.permissions().len();
        let new_count = new.permissions().len();
        if new_count > old_count + self.settings.max_permission_growth {
            return Err(RuntimeError::ReloadValidation {
                plugin: old.id.clone(),
                reason: format!(
                    "permission count grew from {} to {} (at most {} more allowed)",
                    old_count, new_count, self.settings.max_permission_growth
                ),
            });
        }
        Ok(())
    }

    /// Mark `plugin_id` as reloading. Returns the status it had before.
    fn begin(&self, plugin_id: &str) -> Result<Option<ReloadStatus>> {
        let mut statuses = self.statuses.write();
        if statuses.get(plugin_id) == Some(&ReloadStatus::Reloading) {
            return Err(RuntimeError::ReloadFailed {
                plugin: plugin_id.to_string(),
                reason: "a reload is already in progress".to_string(),
            });
        }
        Ok(statuses.insert(plugin_id.to_string(), ReloadStatus::Reloading))
    }

    /// Undo `begin` for an attempt that never touched the plugin.
    fn abandon(&self, plugin_id: &str, previous: Option<ReloadStatus>) {
        let mut statuses = self.statuses.write();
        match previous {
            Some(status) => statuses.insert(plugin_id.to_string(), status),
            None => statuses.remove(plugin_id),
        };
    }

    fn finish(&self, target: &dyn ReloadTarget, event: ReloadEvent) -> ReloadEvent {
        let status = if event.status == ReloadStatus::Success && self.is_watched(&event.plugin_id)
        {
            ReloadStatus::Watching
        } else {
            event.status
        };
        self.statuses.write().insert(event.plugin_id.clone(), status);
        self.record(event.clone());
        target.reload_finished(&event);
        event
    }

    /// Reload `plugin_id` from its file.
    ///
    /// On failure the previous instance is reinstated and the error is
    /// returned as `ReloadFailed`, or as `RollbackFailed` when reinstating
    /// failed too. Every attempt on a known plugin is recorded in the
    /// history; an unknown ID fails with `PluginNotFound` and records nothing.
    pub async fn reload_plugin(&self, plugin_id: &str) -> Result<ReloadEvent> {
        let target = self
            .target
            .upgrade()
            .ok_or_else(|| RuntimeError::Watcher("plugin manager is gone".into()))?;
        let previous = self.begin(plugin_id)?;

        let started = Instant::now();
        let timestamp = Utc::now();
        info!(plugin = %plugin_id, "Reloading plugin");

        let snapshot = match target
            .snapshot(plugin_id, self.settings.snapshot_executions)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.abandon(plugin_id, previous);
                return Err(e);
            }
        };

        let mut event = ReloadEvent {
            plugin_id: plugin_id.to_string(),
            old_version: snapshot.state.version.clone(),
            new_version: None,
            timestamp,
            status: ReloadStatus::Success,
            error: None,
            duration: Duration::ZERO,
            changes: None,
        };

        match self.swap(target.as_ref(), &snapshot).await {
            Ok(new_plugin) => {
                event.new_version = Some(new_plugin.version.clone());

                if let Err(e) = target.restore(plugin_id, &snapshot).await {
                    warn!(plugin = %plugin_id, error = %e, "Failed to restore state after reload");
                }
                if let Ok(after) = target.snapshot(plugin_id, 0).await {
                    let mut before = snapshot.state.clone();
                    before.last_executions.clear();
                    event.changes = Some(before.diff(&after.state).summary());
                }

                event.duration = started.elapsed();
                info!(
                    plugin = %plugin_id,
                    old_version = %event.old_version,
                    new_version = %new_plugin.version,
                    duration_ms = event.duration.as_millis() as u64,
                    "Plugin reloaded"
                );
                Ok(self.finish(target.as_ref(), event))
            }
            Err((new_version, reload_err)) => {
                event.new_version = new_version;
                warn!(plugin = %plugin_id, error = %reload_err, "Reload failed, rolling back");

                let result = match target.reinstate(&snapshot).await {
                    Ok(()) => {
                        event.status = ReloadStatus::RolledBack;
                        event.error = Some(reload_err.to_string());
                        Err(RuntimeError::ReloadFailed {
                            plugin: plugin_id.to_string(),
                            reason: reload_err.to_string(),
                        })
                    }
                    Err(rollback_err) => {
                        error!(
                            plugin = %plugin_id,
                            error = %rollback_err,
                            "Rollback failed, plugin is unloaded"
                        );
                        let err = RuntimeError::RollbackFailed {
                            plugin: plugin_id.to_string(),
                            reload: reload_err.to_string(),
                            rollback: rollback_err.to_string(),
                        };
                        event.status = ReloadStatus::Failed;
                        event.error = Some(err.to_string());
                        Err(err)
                    }
                };
                event.duration = started.elapsed();
                self.finish(target.as_ref(), event);
                result
            }
        }
    }

    /// Unload, load and validate. On failure returns the version that was
    /// loaded (if any) and the error; the new instance is already gone.
    async fn swap(
        &self,
        target: &dyn ReloadTarget,
        snapshot: &ReloadSnapshot,
    ) -> std::result::Result<Plugin, (Option<String>, RuntimeError)> {
        let old = &snapshot.plugin;
        target
            .unload_for_reload(&old.id)
            .await
            .map_err(|e| (None, e))?;

        let new_plugin = target
            .load_for_reload(&old.path)
            .await
            .map_err(|e| (None, e))?;

        if let Err(e) = self.validate_reload(old, &new_plugin) {
            if let Err(unload_err) = target.unload_for_reload(&new_plugin.id).await {
                warn!(
                    plugin = %new_plugin.id,
                    error = %unload_err,
                    "Failed to unload rejected instance"
                );
            }
            return Err((Some(new_plugin.version), e));
        }
        Ok(new_plugin)
    }
}

impl Drop for HotReloadController {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            shutdown(handle);
        }
    }
}

fn shutdown(mut handle: WatcherHandle) {
    if let Some(stop) = handle.stop.take() {
        let _ = stop.send(());
    }
    // Dropping the watcher closes the event channel as well.
    drop(handle.watcher);
    drop(handle.task);
}

fn is_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// Collect file events and reload each affected plugin once its path has been
/// quiet for `debounce`.
async fn run_watch_loop(
    controller: Weak<HotReloadController>,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    mut stop: oneshot::Receiver<()>,
    debounce: Duration,
) {
    let mut pending: HashMap<String, Instant> = HashMap::new();

    loop {
        let next_due = pending.values().min().copied();

        tokio::select! {
            _ = &mut stop => break,
            received = events.recv() => {
                let Some(received) = received else { break };
                let event = match received {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "File watcher error");
                        continue;
                    }
                };
                if !is_change(&event.kind) {
                    continue;
                }
                let Some(controller) = controller.upgrade() else { break };
                for path in &event.paths {
                    if let Some(plugin_id) = controller.plugin_for_path(path) {
                        debug!(plugin = %plugin_id, path = %path.display(), "Plugin file changed");
                        pending.insert(plugin_id, Instant::now() + debounce);
                    }
                }
            }
            _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let now = Instant::now();
                let due: Vec<String> = pending
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                let Some(controller) = controller.upgrade() else { break };
                for plugin_id in due {
                    pending.remove(&plugin_id);
                    if let Err(e) = controller.reload_plugin(&plugin_id).await {
                        warn!(plugin = %plugin_id, error = %e, "Automatic reload failed");
                    }
                }
            }
        }
    }
    debug!("File watcher loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoopEngine;
    use crate::plugins::types::PluginMetadata;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn plugin(id: &str, version: &str, permissions: &[&str]) -> Plugin {
        let metadata = PluginMetadata {
            id: id.to_string(),
            name: id.to_string(),
            version: version.to_string(),
            author: "tester".to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        };
        Plugin::new(metadata, PathBuf::from(format!("{}.lua", id)), Arc::new(NoopEngine))
    }

    /// In-memory target: one slot per plugin ID, and a queue of instances
    /// returned by successive loads.
    #[derive(Default)]
    struct FakeTarget {
        loaded: Mutex<HashMap<String, Plugin>>,
        next_loads: Mutex<VecDeque<Result<Plugin>>>,
        fail_reinstate: AtomicBool,
        finished: Mutex<Vec<ReloadStatus>>,
    }

    #[async_trait]
    impl ReloadTarget for FakeTarget {
        async fn snapshot(&self, plugin_id: &str, _executions: usize) -> Result<ReloadSnapshot> {
            let plugin = self
                .loaded
                .lock()
                .get(plugin_id)
                .cloned()
                .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;
            let mut state = PluginState::new(&plugin.id, &plugin.version);
            state.enabled = plugin.enabled;
            Ok(ReloadSnapshot {
                state,
                plugin,
                policy: None,
            })
        }

        async fn unload_for_reload(&self, plugin_id: &str) -> Result<()> {
            self.loaded
                .lock()
                .remove(plugin_id)
                .map(|_| ())
                .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))
        }

        async fn load_for_reload(&self, _path: &Path) -> Result<Plugin> {
            let next = self
                .next_loads
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(RuntimeError::Config("no load queued".into())))?;
            self.loaded.lock().insert(next.id.clone(), next.clone());
            Ok(next)
        }

        async fn restore(&self, plugin_id: &str, snapshot: &ReloadSnapshot) -> Result<()> {
            if let Some(p) = self.loaded.lock().get_mut(plugin_id) {
                p.enabled = snapshot.state.enabled;
            }
            Ok(())
        }

        async fn reinstate(&self, snapshot: &ReloadSnapshot) -> Result<()> {
            if self.fail_reinstate.load(Ordering::SeqCst) {
                return Err(RuntimeError::Config("reinstate refused".into()));
            }
            self.loaded
                .lock()
                .insert(snapshot.plugin.id.clone(), snapshot.plugin.clone());
            Ok(())
        }

        fn reload_finished(&self, event: &ReloadEvent) {
            self.finished.lock().push(event.status);
        }
    }

    fn as_target(target: &Arc<FakeTarget>) -> Weak<dyn ReloadTarget> {
        let weak: Weak<FakeTarget> = Arc::downgrade(target);
        weak
    }

    fn setup(initial: Plugin) -> (Arc<FakeTarget>, HotReloadController) {
        let target = Arc::new(FakeTarget::default());
        target.loaded.lock().insert(initial.id.clone(), initial);
        let weak = as_target(&target);
        let controller = HotReloadController::new(weak, ReloadConfig::default());
        (target, controller)
    }

    #[tokio::test]
    async fn test_successful_reload_preserves_enabled_flag() {
        let mut old = plugin("p", "1.0.0", &["read_save"]);
        old.enabled = false;
        let (target, controller) = setup(old);
        target
            .next_loads
            .lock()
            .push_back(Ok(plugin("p", "1.1.0", &["read_save"])));

        let event = controller.reload_plugin("p").await.unwrap();
        assert_eq!(event.status, ReloadStatus::Success);
        assert_eq!(event.old_version, "1.0.0");
        assert_eq!(event.new_version.as_deref(), Some("1.1.0"));

        let current = target.loaded.lock().get("p").cloned().unwrap();
        assert_eq!(current.version, "1.1.0");
        assert!(!current.enabled);
        assert_eq!(controller.reload_status("p"), Some(ReloadStatus::Success));
        assert_eq!(*target.finished.lock(), vec![ReloadStatus::Success]);
    }

    #[tokio::test]
    async fn test_id_change_rolls_back() {
        let (target, controller) = setup(plugin("p", "1.0.0", &[]));
        target
            .next_loads
            .lock()
            .push_back(Ok(plugin("renamed", "2.0.0", &[])));

        let err = controller.reload_plugin("p").await.unwrap_err();
        assert!(matches!(err, RuntimeError::ReloadFailed { .. }));
        assert!(err.to_string().contains("plugin ID changed"));

        let loaded = target.loaded.lock();
        assert_eq!(loaded.get("p").unwrap().version, "1.0.0");
        assert!(!loaded.contains_key("renamed"));
        drop(loaded);

        let history = controller.history(0);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ReloadStatus::RolledBack);
        assert_eq!(history[0].new_version.as_deref(), Some("2.0.0"));
        assert_eq!(controller.reload_status("p"), Some(ReloadStatus::RolledBack));
    }

    #[tokio::test]
    async fn test_permission_escalation_rolls_back() {
        let (target, controller) = setup(plugin("p", "1.0.0", &["a"]));
        target.next_loads.lock().push_back(Ok(plugin(
            "p",
            "1.0.1",
            &["a", "b", "c", "d", "e", "f", "g"],
        )));

        let err = controller.reload_plugin("p").await.unwrap_err();
        assert!(err.to_string().contains("permission count grew"));
        assert_eq!(target.loaded.lock().get("p").unwrap().version, "1.0.0");
    }

    #[tokio::test]
    async fn test_permission_growth_within_slack_is_accepted() {
        let (target, controller) = setup(plugin("p", "1.0.0", &["a"]));
        target
            .next_loads
            .lock()
            .push_back(Ok(plugin("p", "1.0.1", &["a", "b", "c", "d", "e", "f"])));
        assert!(controller.reload_plugin("p").await.is_ok());
    }

    #[tokio::test]
    async fn test_load_failure_rolls_back() {
        let (target, controller) = setup(plugin("p", "1.0.0", &[]));
        target
            .next_loads
            .lock()
            .push_back(Err(RuntimeError::InvalidMetadata("broken".into())));

        let err = controller.reload_plugin("p").await.unwrap_err();
        assert!(matches!(err, RuntimeError::ReloadFailed { .. }));
        assert_eq!(target.loaded.lock().get("p").unwrap().version, "1.0.0");
        assert_eq!(controller.history(0)[0].new_version, None);
    }

    #[tokio::test]
    async fn test_failed_rollback_reports_both_errors() {
        let (target, controller) = setup(plugin("p", "1.0.0", &[]));
        target.fail_reinstate.store(true, Ordering::SeqCst);

        let err = controller.reload_plugin("p").await.unwrap_err();
        match err {
            RuntimeError::RollbackFailed {
                reload, rollback, ..
            } => {
                assert!(reload.contains("no load queued"));
                assert!(rollback.contains("reinstate refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(controller.reload_status("p"), Some(ReloadStatus::Failed));
    }

    #[tokio::test]
    async fn test_reload_unknown_plugin_leaves_no_state() {
        let (_target, controller) = setup(plugin("p", "1.0.0", &[]));
        for _ in 0..3 {
            let err = controller.reload_plugin("ghost").await.unwrap_err();
            assert!(matches!(err, RuntimeError::PluginNotFound(_)));
        }
        assert_eq!(controller.reload_status("ghost"), None);
        assert!(controller.history(0).is_empty());
        assert!(controller.statuses.read().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let target = Arc::new(FakeTarget::default());
        let weak = as_target(&target);
        let settings = ReloadConfig {
            history_len: 3,
            ..Default::default()
        };
        let controller = HotReloadController::new(weak, settings);

        for i in 0..5 {
            let _ = controller.reload_plugin(&format!("p{}", i)).await;
        }
        let history = controller.history(0);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].plugin_id, "p4");
        assert_eq!(controller.history(1).len(), 1);
        assert_eq!(controller.plugin_history("p3", 0).len(), 1);
        assert!(controller.plugin_history("p0", 0).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_target_is_an_error() {
        let target = Arc::new(FakeTarget::default());
        let weak = as_target(&target);
        drop(target);
        let controller = HotReloadController::new(weak, ReloadConfig::default());
        assert!(matches!(
            controller.reload_plugin("p").await,
            Err(RuntimeError::Watcher(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_index() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.lua");
        let b = dir.path().join("b.lua");
        std::fs::write(&a, "-- a").unwrap();
        std::fs::write(&b, "-- b").unwrap();

        let (_target, controller) = setup(plugin("p", "1.0.0", &[]));
        let controller = Arc::new(controller);
        controller.enable().unwrap();
        assert!(controller.enable().is_err());

        controller.watch_plugin("a", &a).unwrap();
        controller.watch_plugin("b", &b).unwrap();
        assert!(controller.watch_plugin("c", &dir.path().join("missing.lua")).is_err());

        assert_eq!(controller.reload_status("a"), Some(ReloadStatus::Watching));
        let ids: Vec<String> = controller.watched_plugins().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(controller.plugin_for_path(&a).as_deref(), Some("a"));
        let manifest = a.canonicalize().unwrap().with_extension("json");
        assert_eq!(controller.plugin_for_path(&manifest).as_deref(), Some("a"));
        assert_eq!(controller.plugin_for_path(&dir.path().join("other.json")), None);

        controller.unwatch_plugin("a").unwrap();
        assert!(!controller.is_watched("a"));
        assert!(controller.unwatch_plugin("a").is_err());

        controller.disable().unwrap();
        assert!(!controller.is_running());
        assert!(controller.disable().is_err());
        assert!(controller.is_watched("b"));

        controller.stop();
        assert!(controller.watched_plugins().is_empty());
    }

    #[test]
    fn test_enable_requires_runtime() {
        let (_target, controller) = setup(plugin("p", "1.0.0", &[]));
        let controller = Arc::new(controller);
        assert!(matches!(controller.enable(), Err(RuntimeError::Watcher(_))));
    }
}
