//! Observability collectors shared by the plugin manager.

use std::time::Duration;

pub mod analytics;
pub mod profiler;

pub use analytics::{Analytics, AnalyticsEvent, AnalyticsEventType, PluginUsage, Trend, TrendAnalysis};
pub use profiler::{AggregateMetrics, ExecutionMetrics, Profiler};

/// Mean of `count` samples totalling `total`. Zero when there are none.
pub(crate) fn mean_duration(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => total.div_f64(count as f64),
    }
}
