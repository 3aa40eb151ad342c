//! Metrics sink seam.
//!
//! Fire-and-forget: nothing here may sit on the correctness path, so the
//! trait is synchronous and infallible and implementations must not block.

use std::sync::Arc;

/// Counters and gauges reported by the engine.
pub trait MetricsSink: Send + Sync {
    /// Gauge: definitions currently Enabled.
    fn enabled_timers(&self, count: u64);
    /// Gauge: pending marks in the current 10-minute window.
    fn pending_timers(&self, count: u64);
    /// Counter: a callback fired.
    fn trigger(&self);
    /// Counter: a callback failed or timed out.
    fn trigger_failed(&self);
    /// Histogram-ish: scheduled-to-fired latency.
    fn trigger_latency_ms(&self, millis: i64);
}

pub type DynMetricsSink = Arc<dyn MetricsSink>;

/// Default sink: structured log lines at debug level.
#[derive(Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn enabled_timers(&self, count: u64) {
        tracing::debug!(enabled_timers = count, "metric");
    }

    fn pending_timers(&self, count: u64) {
        tracing::debug!(pending_timers = count, "metric");
    }

    fn trigger(&self) {
        tracing::debug!(trigger = 1, "metric");
    }

    fn trigger_failed(&self) {
        tracing::debug!(trigger_failed = 1, "metric");
    }

    fn trigger_latency_ms(&self, millis: i64) {
        tracing::debug!(trigger_latency_ms = millis, "metric");
    }
}
