//! Usage analytics: a bounded event log plus per-plugin usage statistics and
//! simple trend detection over recent executions.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::plugins::types::ExecutionStatus;
use crate::utils::mean_duration;

/// Percentage change a metric must exceed to count as a trend.
const TREND_THRESHOLD: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEventType {
    PluginLoad,
    PluginExecute,
    PluginError,
    PluginUnload,
}

impl AnalyticsEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsEventType::PluginLoad => "plugin_load",
            AnalyticsEventType::PluginExecute => "plugin_execute",
            AnalyticsEventType::PluginError => "plugin_error",
            AnalyticsEventType::PluginUnload => "plugin_unload",
        }
    }
}

impl fmt::Display for AnalyticsEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsEvent {
    pub event_type: AnalyticsEventType,
    pub plugin_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalyticsEvent {
    pub fn new(event_type: AnalyticsEventType, plugin_id: impl Into<String>) -> Self {
        Self {
            event_type,
            plugin_id: plugin_id.into(),
            timestamp: Utc::now(),
            duration: Duration::ZERO,
            status: None,
            error: None,
        }
    }

    pub fn execution(
        plugin_id: impl Into<String>,
        duration: Duration,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Self {
        Self {
            duration,
            status: Some(status),
            error: error.map(str::to_string),
            ..Self::new(AnalyticsEventType::PluginExecute, plugin_id)
        }
    }

    fn is_failure(&self) -> bool {
        matches!(
            self.status,
            Some(ExecutionStatus::Error) | Some(ExecutionStatus::Timeout)
        )
    }
}

/// Usage counters for one plugin. Not affected by event-log eviction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginUsage {
    pub plugin_id: String,
    pub load_count: u64,
    pub unload_count: u64,
    pub execution_count: u64,
    pub error_count: u64,
    /// Percentage of executions that succeeded.
    pub success_rate: f64,
    pub total_execution_time: Duration,
    pub average_execution_time: Duration,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl PluginUsage {
    fn new(plugin_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            load_count: 0,
            unload_count: 0,
            execution_count: 0,
            error_count: 0,
            success_rate: 0.0,
            total_execution_time: Duration::ZERO,
            average_execution_time: Duration::ZERO,
            first_seen: at,
            last_activity: at,
        }
    }

    fn update(&mut self, event: &AnalyticsEvent) {
        self.last_activity = event.timestamp;
        match event.event_type {
            AnalyticsEventType::PluginLoad => self.load_count += 1,
            AnalyticsEventType::PluginUnload => self.unload_count += 1,
            AnalyticsEventType::PluginError => self.error_count += 1,
            AnalyticsEventType::PluginExecute => {
                self.execution_count += 1;
                self.total_execution_time += event.duration;
                self.average_execution_time =
                    mean_duration(self.total_execution_time, self.execution_count);
                if event.is_failure() {
                    self.error_count += 1;
                }
            }
        }
        if self.execution_count > 0 {
            let succeeded = self.execution_count.saturating_sub(self.error_count);
            self.success_rate = succeeded as f64 / self.execution_count as f64 * 100.0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    fn from_change(change: f64) -> Self {
        if change > TREND_THRESHOLD {
            Trend::Increasing
        } else if change < -TREND_THRESHOLD {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendAnalysis {
    /// `execution_duration` (seconds) or `error_rate` (percent).
    pub metric: &'static str,
    pub trend: Trend,
    /// Relative change for durations, absolute percentage-point change for error rate.
    pub change_percent: f64,
    pub recent_average: f64,
    pub previous_average: f64,
    pub sample_size: usize,
}

#[derive(Debug, Default)]
struct AnalyticsState {
    events: VecDeque<AnalyticsEvent>,
    usage: HashMap<String, PluginUsage>,
}

/// Thread-safe usage analytics collector.
#[derive(Debug)]
pub struct Analytics {
    state: Mutex<AnalyticsState>,
    capacity: usize,
}

impl Default for Analytics {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl Analytics {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(AnalyticsState::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, event: AnalyticsEvent) {
        let mut state = self.state.lock();
        state
            .usage
            .entry(event.plugin_id.clone())
            .or_insert_with(|| PluginUsage::new(&event.plugin_id, event.timestamp))
            .update(&event);
        if state.events.len() >= self.capacity {
            state.events.pop_front();
        }
        state.events.push_back(event);
    }

    pub fn record_load(&self, plugin_id: &str) {
        self.record(AnalyticsEvent::new(AnalyticsEventType::PluginLoad, plugin_id));
    }

    pub fn record_unload(&self, plugin_id: &str) {
        self.record(AnalyticsEvent::new(AnalyticsEventType::PluginUnload, plugin_id));
    }

    pub fn record_error(&self, plugin_id: &str, error: &str) {
        let mut event = AnalyticsEvent::new(AnalyticsEventType::PluginError, plugin_id);
        event.error = Some(error.to_string());
        self.record(event);
    }

    pub fn record_execution(
        &self,
        plugin_id: &str,
        duration: Duration,
        status: ExecutionStatus,
        error: Option<&str>,
    ) {
        self.record(AnalyticsEvent::execution(plugin_id, duration, status, error));
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Events strictly between `start` and `end`.
    pub fn events_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<AnalyticsEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.timestamp > start && e.timestamp < end)
            .cloned()
            .collect()
    }

    pub fn plugin_events(&self, plugin_id: &str) -> Vec<AnalyticsEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    pub fn usage(&self, plugin_id: &str) -> Option<PluginUsage> {
        self.state.lock().usage.get(plugin_id).cloned()
    }

    pub fn all_usage(&self) -> HashMap<String, PluginUsage> {
        self.state.lock().usage.clone()
    }

    /// Plugins ranked by execution count. A `limit` of zero returns all.
    pub fn most_used(&self, limit: usize) -> Vec<PluginUsage> {
        let mut ranked: Vec<_> = self.state.lock().usage.values().cloned().collect();
        ranked.sort_by(|a, b| {
            b.execution_count
                .cmp(&a.execution_count)
                .then_with(|| a.plugin_id.cmp(&b.plugin_id))
        });
        if limit > 0 {
            ranked.truncate(limit);
        }
        ranked
    }

    /// Plugins with at least `min_executions`, highest success rate first.
    pub fn most_reliable(&self, min_executions: u64) -> Vec<PluginUsage> {
        let mut ranked: Vec<_> = self
            .state
            .lock()
            .usage
            .values()
            .filter(|u| u.execution_count >= min_executions)
            .cloned()
            .collect();
        ranked.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then_with(|| a.plugin_id.cmp(&b.plugin_id))
        });
        ranked
    }

    /// Compare the older and newer half of a plugin's retained executions.
    ///
    /// Needs at least `2 * sample_size` executions; each half is trimmed to
    /// `sample_size` events nearest the split.
    pub fn analyze_trends(&self, plugin_id: &str, sample_size: usize) -> Vec<TrendAnalysis> {
        let executions: Vec<AnalyticsEvent> = self
            .state
            .lock()
            .events
            .iter()
            .filter(|e| e.plugin_id == plugin_id && e.event_type == AnalyticsEventType::PluginExecute)
            .cloned()
            .collect();
        if executions.len() < 2 || executions.len() < sample_size * 2 {
            return Vec::new();
        }

        let (previous, recent) = executions.split_at(executions.len() / 2);
        let (previous, recent) = if sample_size > 0 {
            (
                &previous[previous.len().saturating_sub(sample_size)..],
                &recent[..recent.len().min(sample_size)],
            )
        } else {
            (previous, recent)
        };

        let mut trends = Vec::new();

        let recent_duration = average_seconds(recent);
        let previous_duration = average_seconds(previous);
        if recent_duration > 0.0 && previous_duration > 0.0 {
            let change = (recent_duration - previous_duration) / previous_duration * 100.0;
            trends.push(TrendAnalysis {
                metric: "execution_duration",
                trend: Trend::from_change(change),
                change_percent: change,
                recent_average: recent_duration,
                previous_average: previous_duration,
                sample_size: recent.len(),
            });
        }

        let recent_errors = error_rate(recent);
        let previous_errors = error_rate(previous);
        let change = recent_errors - previous_errors;
        trends.push(TrendAnalysis {
            metric: "error_rate",
            trend: Trend::from_change(change),
            change_percent: change,
            recent_average: recent_errors,
            previous_average: previous_errors,
            sample_size: recent.len(),
        });

        trends
    }

    pub fn summary(&self) -> String {
        let state = self.state.lock();
        let executions: u64 = state.usage.values().map(|u| u.execution_count).sum();
        let errors: u64 = state.usage.values().map(|u| u.error_count).sum();

        let mut summary = String::from("=== Plugin Analytics Summary ===\n");
        summary.push_str(&format!("Tracked Plugins: {}\n", state.usage.len()));
        summary.push_str(&format!("Stored Events: {}\n", state.events.len()));
        summary.push_str(&format!("Total Executions: {}\n", executions));
        summary.push_str(&format!("Total Errors: {}\n", errors));
        summary
    }

    pub fn export_json(&self) -> Value {
        let state = self.state.lock();
        let usage: BTreeMap<&String, &PluginUsage> = state.usage.iter().collect();
        let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
        for event in &state.events {
            *by_type.entry(event.event_type.as_str()).or_default() += 1;
        }
        json!({
            "timestamp": Utc::now(),
            "total_events": state.events.len(),
            "events_by_type": by_type,
            "plugins": usage,
        })
    }

    pub fn clear(&self) {
        *self.state.lock() = AnalyticsState::default();
    }
}

fn average_seconds(events: &[AnalyticsEvent]) -> f64 {
    let durations: Vec<f64> = events
        .iter()
        .filter(|e| !e.duration.is_zero())
        .map(|e| e.duration.as_secs_f64())
        .collect();
    if durations.is_empty() {
        return 0.0;
    }
    durations.iter().sum::<f64>() / durations.len() as f64
}

fn error_rate(events: &[AnalyticsEvent]) -> f64 {
    if events.is_empty() {
        return 0.0;
    }
    let failed = events.iter().filter(|e| e.is_failure()).count();
    failed as f64 / events.len() as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_usage_counters() {
        let analytics = Analytics::default();
        analytics.record_load("p");
        analytics.record_execution("p", ms(10), ExecutionStatus::Success, None);
        analytics.record_execution("p", ms(30), ExecutionStatus::Timeout, None);
        analytics.record_unload("p");

        let usage = analytics.usage("p").unwrap();
        assert_eq!(usage.load_count, 1);
        assert_eq!(usage.unload_count, 1);
        assert_eq!(usage.execution_count, 2);
        assert_eq!(usage.error_count, 1);
        assert_eq!(usage.average_execution_time, ms(20));
        assert!((usage.success_rate - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_average_survives_u32_execution_counts() {
        let mut usage = PluginUsage::new("p", Utc::now());
        usage.execution_count = u64::from(u32::MAX);
        usage.total_execution_time = Duration::from_secs(u64::from(u32::MAX));

        usage.update(&AnalyticsEvent::execution("p", ms(1_000), ExecutionStatus::Success, None));
        assert_eq!(usage.execution_count, 1 << 32);
        assert_eq!(usage.average_execution_time, Duration::from_secs(1));
    }

    #[test]
    fn test_event_log_is_bounded_but_usage_is_not() {
        let analytics = Analytics::new(3);
        for _ in 0..10 {
            analytics.record_execution("p", ms(1), ExecutionStatus::Success, None);
        }
        assert_eq!(analytics.event_count(), 3);
        assert_eq!(analytics.usage("p").unwrap().execution_count, 10);
    }

    #[test]
    fn test_rankings() {
        let analytics = Analytics::default();
        for _ in 0..3 {
            analytics.record_execution("busy", ms(1), ExecutionStatus::Error, Some("x"));
        }
        analytics.record_execution("calm", ms(1), ExecutionStatus::Success, None);

        let used: Vec<_> = analytics.most_used(1).into_iter().map(|u| u.plugin_id).collect();
        assert_eq!(used, vec!["busy"]);

        let reliable: Vec<_> = analytics
            .most_reliable(1)
            .into_iter()
            .map(|u| u.plugin_id)
            .collect();
        assert_eq!(reliable, vec!["calm", "busy"]);
        assert_eq!(analytics.most_reliable(2).len(), 1);
    }

    #[test]
    fn test_trends_detect_slowdown_and_errors() {
        let analytics = Analytics::default();
        for _ in 0..5 {
            analytics.record_execution("p", ms(10), ExecutionStatus::Success, None);
        }
        for _ in 0..5 {
            analytics.record_execution("p", ms(50), ExecutionStatus::Error, Some("x"));
        }

        let trends = analytics.analyze_trends("p", 5);
        assert_eq!(trends.len(), 2);
        assert_eq!(trends[0].metric, "execution_duration");
        assert_eq!(trends[0].trend, Trend::Increasing);
        assert_eq!(trends[1].metric, "error_rate");
        assert_eq!(trends[1].trend, Trend::Increasing);
        assert!((trends[1].change_percent - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_trends_need_enough_samples() {
        let analytics = Analytics::default();
        analytics.record_execution("p", ms(10), ExecutionStatus::Success, None);
        assert!(analytics.analyze_trends("p", 5).is_empty());
    }

    #[test]
    fn test_stable_trend() {
        let analytics = Analytics::default();
        for _ in 0..8 {
            analytics.record_execution("p", ms(10), ExecutionStatus::Success, None);
        }
        let trends = analytics.analyze_trends("p", 0);
        assert!(trends.iter().all(|t| t.trend == Trend::Stable));
    }

    #[test]
    fn test_summary_export_and_clear() {
        let analytics = Analytics::default();
        analytics.record_load("p");
        analytics.record_error("p", "boom");

        assert!(analytics.summary().contains("Total Errors: 1"));
        let exported = analytics.export_json();
        assert_eq!(exported["total_events"], 2);
        assert_eq!(exported["events_by_type"]["plugin_error"], 1);
        assert_eq!(exported["plugins"]["p"]["load_count"], 1);

        analytics.clear();
        assert_eq!(analytics.event_count(), 0);
        assert!(analytics.all_usage().is_empty());
    }
}
