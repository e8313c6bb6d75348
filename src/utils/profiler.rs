//! Plugin execution profiler.
//!
//! Keeps a bounded per-plugin history of execution metrics and running
//! aggregates (counts, durations, error rate, memory). All recording methods
//! take `&self`; state lives behind one mutex so a profiler can be shared as
//! `Arc<Profiler>`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::plugins::types::ExecutionStatus;
use crate::utils::mean_duration;

const SLOW_REPORT_THRESHOLD: Duration = Duration::from_secs(1);
const BOTTLENECK_ERROR_RATE: f64 = 25.0;
const BOTTLENECK_AVG_DURATION: Duration = Duration::from_secs(5);
const BOTTLENECK_MEMORY_MB: f64 = 100.0;

/// Metrics of a single execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    pub plugin_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Engine-reported memory, when the engine reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
}

/// Running totals for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateMetrics {
    pub plugin_id: String,
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub peak_memory_mb: f64,
    /// Failures plus timeouts as a percentage of all executions.
    pub error_rate: f64,
    pub first_execution: DateTime<Utc>,
    pub last_execution: DateTime<Utc>,
}

impl AggregateMetrics {
    fn new(plugin_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            timeout_count: 0,
            total_duration: Duration::ZERO,
            average_duration: Duration::ZERO,
            min_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
            peak_memory_mb: 0.0,
            error_rate: 0.0,
            first_execution: at,
            last_execution: at,
        }
    }

    fn update(&mut self, metric: &ExecutionMetrics) {
        self.execution_count += 1;
        self.last_execution = metric.timestamp;
        self.total_duration += metric.duration;

        match metric.status {
            ExecutionStatus::Success => self.success_count += 1,
            ExecutionStatus::Error => self.failure_count += 1,
            ExecutionStatus::Timeout => self.timeout_count += 1,
        }

        if self.execution_count == 1 || metric.duration > self.max_duration {
            self.max_duration = metric.duration;
        }
        if self.execution_count == 1 || metric.duration < self.min_duration {
            self.min_duration = metric.duration;
        }
        self.average_duration = mean_duration(self.total_duration, self.execution_count);

        if let Some(mb) = metric.memory_mb {
            self.peak_memory_mb = self.peak_memory_mb.max(mb);
        }

        let failed = self.failure_count + self.timeout_count;
        self.error_rate = failed as f64 / self.execution_count as f64 * 100.0;
    }
}

#[derive(Debug, Default)]
struct ProfilerState {
    history: HashMap<String, VecDeque<ExecutionMetrics>>,
    aggregates: HashMap<String, AggregateMetrics>,
}

/// Thread-safe execution profiler.
#[derive(Debug)]
pub struct Profiler {
    state: Mutex<ProfilerState>,
    history_len: usize,
    sampling_rate: f64,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new(1_000, 1.0)
    }
}

impl Profiler {
    /// `sampling_rate` is clamped to `0.0..=1.0` and controls what fraction
    /// of executions enter the history. Aggregates count every execution.
    pub fn new(history_len: usize, sampling_rate: f64) -> Self {
        Self {
            state: Mutex::new(ProfilerState::default()),
            history_len: history_len.max(1),
            sampling_rate: sampling_rate.clamp(0.0, 1.0),
        }
    }

    fn should_sample(&self) -> bool {
        if self.sampling_rate >= 1.0 {
            return true;
        }
        if self.sampling_rate <= 0.0 {
            return false;
        }
        rand::random::<f64>() < self.sampling_rate
    }

    pub fn record_execution(
        &self,
        plugin_id: &str,
        duration: Duration,
        status: ExecutionStatus,
        error: Option<&str>,
        memory_bytes: Option<u64>,
    ) -> ExecutionMetrics {
        let metric = ExecutionMetrics {
            plugin_id: plugin_id.to_string(),
            timestamp: Utc::now(),
            duration,
            status,
            error: error.map(str::to_string),
            memory_mb: memory_bytes.map(|b| b as f64 / 1024.0 / 1024.0),
        };
        let sampled = self.should_sample();

        let mut state = self.state.lock();
        state
            .aggregates
            .entry(plugin_id.to_string())
            .or_insert_with(|| AggregateMetrics::new(plugin_id, metric.timestamp))
            .update(&metric);

        if sampled {
            let history = state.history.entry(plugin_id.to_string()).or_default();
            if history.len() >= self.history_len {
                history.pop_front();
            }
            history.push_back(metric.clone());
        }
        metric
    }

    pub fn metrics(&self, plugin_id: &str) -> Vec<ExecutionMetrics> {
        self.state
            .lock()
            .history
            .get(plugin_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn aggregate(&self, plugin_id: &str) -> Option<AggregateMetrics> {
        self.state.lock().aggregates.get(plugin_id).cloned()
    }

    pub fn aggregates(&self) -> HashMap<String, AggregateMetrics> {
        self.state.lock().aggregates.clone()
    }

    /// Plugins whose average duration exceeds `threshold`, slowest first.
    pub fn slow_plugins(&self, threshold: Duration) -> Vec<AggregateMetrics> {
        let mut slow: Vec<_> = self
            .state
            .lock()
            .aggregates
            .values()
            .filter(|a| a.average_duration > threshold)
            .cloned()
            .collect();
        slow.sort_by(|a, b| b.average_duration.cmp(&a.average_duration));
        slow
    }

    /// Plugins with any failure, highest error rate first.
    pub fn failed_plugins(&self) -> Vec<AggregateMetrics> {
        let mut failed: Vec<_> = self
            .state
            .lock()
            .aggregates
            .values()
            .filter(|a| a.error_rate > 0.0)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.error_rate.total_cmp(&a.error_rate));
        failed
    }

    /// Human-readable findings, sorted by plugin ID.
    pub fn bottlenecks(&self) -> Vec<String> {
        let state = self.state.lock();
        let sorted: BTreeMap<_, _> = state.aggregates.iter().collect();

        let mut findings = Vec::new();
        for (id, agg) in sorted {
            if agg.error_rate > BOTTLENECK_ERROR_RATE {
                findings.push(format!(
                    "HIGH_ERROR_RATE: {} has {:.1}% error rate",
                    id, agg.error_rate
                ));
            }
            if agg.average_duration > BOTTLENECK_AVG_DURATION {
                findings.push(format!(
                    "SLOW_EXECUTION: {} takes avg {:.2}s",
                    id,
                    agg.average_duration.as_secs_f64()
                ));
            }
            if agg.peak_memory_mb > BOTTLENECK_MEMORY_MB {
                findings.push(format!(
                    "HIGH_MEMORY: {} peaks at {:.1}MB",
                    id, agg.peak_memory_mb
                ));
            }
            if agg.execution_count > 1000 && agg.failure_count > 100 {
                findings.push(format!(
                    "UNRELIABLE: {} failed {} times out of {} executions",
                    id, agg.failure_count, agg.execution_count
                ));
            }
        }
        findings
    }

    pub fn performance_report(&self) -> String {
        let aggregates = self.aggregates();
        let mut report = String::from("=== Plugin Performance Report ===\n\n");
        if aggregates.is_empty() {
            report.push_str("No metrics collected yet.\n");
            return report;
        }

        let executions: u64 = aggregates.values().map(|a| a.execution_count).sum();
        let failures: u64 = aggregates
            .values()
            .map(|a| a.failure_count + a.timeout_count)
            .sum();
        let total: Duration = aggregates.values().map(|a| a.total_duration).sum();

        report.push_str("=== Overall Statistics ===\n");
        report.push_str(&format!("Total Executions: {}\n", executions));
        report.push_str(&format!(
            "Total Failures: {} ({:.1}%)\n",
            failures,
            failures as f64 / executions.max(1) as f64 * 100.0
        ));
        report.push_str(&format!(
            "Total Execution Time: {:.2}s\n\n",
            total.as_secs_f64()
        ));

        let slow = self.slow_plugins(SLOW_REPORT_THRESHOLD);
        if !slow.is_empty() {
            report.push_str("=== Slow Plugins (avg > 1s) ===\n");
            for agg in slow {
                report.push_str(&format!(
                    "- {}: avg {:.2}s (min {:.2}s, max {:.2}s)\n",
                    agg.plugin_id,
                    agg.average_duration.as_secs_f64(),
                    agg.min_duration.as_secs_f64(),
                    agg.max_duration.as_secs_f64()
                ));
            }
            report.push('\n');
        }

        let failed = self.failed_plugins();
        if !failed.is_empty() {
            report.push_str("=== Plugins with Failures ===\n");
            for agg in failed {
                report.push_str(&format!(
                    "- {}: {:.1}% error rate ({}/{})\n",
                    agg.plugin_id,
                    agg.error_rate,
                    agg.failure_count + agg.timeout_count,
                    agg.execution_count
                ));
            }
            report.push('\n');
        }

        let bottlenecks = self.bottlenecks();
        if !bottlenecks.is_empty() {
            report.push_str("=== Detected Bottlenecks ===\n");
            for finding in bottlenecks {
                report.push_str(&format!("- {}\n", finding));
            }
            report.push('\n');
        }

        report
    }

    /// Aggregates plus the last ten sampled executions of each plugin.
    pub fn export_json(&self) -> Value {
        let state = self.state.lock();
        let recent: BTreeMap<&String, Vec<&ExecutionMetrics>> = state
            .history
            .iter()
            .map(|(id, history)| {
                let skip = history.len().saturating_sub(10);
                (id, history.iter().skip(skip).collect())
            })
            .collect();
        let aggregates: BTreeMap<&String, &AggregateMetrics> = state.aggregates.iter().collect();
        json!({
            "aggregates": aggregates,
            "recent_metrics": recent,
        })
    }

    pub fn clear(&self, plugin_id: &str) {
        let mut state = self.state.lock();
        state.history.remove(plugin_id);
        state.aggregates.remove(plugin_id);
    }

    pub fn clear_all(&self) {
        *self.state.lock() = ProfilerState::default();
    }
}
