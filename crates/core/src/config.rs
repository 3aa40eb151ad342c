//! Engine configuration.

use std::time::Duration;

use crate::error::{BelfryError, Result};

/// Configuration for the timer engine.
///
/// `shard_count` is operationally increase-only: lowering it leaves buckets
/// above the new count unreachable by new registrations' shard assignment.
/// Shrinking must be handled as an explicit migration, not a config edit.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of hash shards for bucket fan-out.
    pub shard_count: u32,
    /// Polling workers per process.
    pub polling_workers: usize,
    /// Startup stagger between polling workers, to desynchronize ticks.
    pub polling_stagger: Duration,
    /// Sleep between polling ticks.
    pub polling_sleep: Duration,
    /// Bucket-ready consumers per process.
    pub dispatch_consumers: usize,
    /// Forward scan window for due timers.
    pub dispatch_window: Duration,
    /// Sleep between scan passes within a slice.
    pub dispatch_sleep: Duration,
    /// Timer-fire consumers per process.
    pub notify_consumers: usize,
    /// Shared worker pool capacity.
    pub pool_capacity: usize,
    /// Concurrent callback invocations allowed.
    pub limiter_capacity: usize,
    /// Overall graceful shutdown deadline.
    pub shutdown_timeout: Duration,
    /// Per-stage grace after closing consumers, letting in-flight
    /// minute-long scan loops finish naturally.
    pub stage_grace: Duration,
    /// Interval of the metrics monitor loop.
    pub monitor_interval: Duration,
    /// Interval of the history-retention janitor loop.
    pub janitor_interval: Duration,
    /// Run-history retention in days; values below 7 are raised to 7.
    pub history_keep_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            polling_workers: 2,
            polling_stagger: Duration::from_secs(1),
            polling_sleep: Duration::from_secs(10),
            dispatch_consumers: 2,
            dispatch_window: Duration::from_secs(60),
            dispatch_sleep: Duration::from_secs(1),
            notify_consumers: 2,
            pool_capacity: 64,
            limiter_capacity: 32,
            shutdown_timeout: Duration::from_secs(120),
            stage_grace: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(3600),
            history_keep_days: 7,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Validate operational bounds.
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(BelfryError::Config("shard_count must be >= 1".to_string()));
        }
        if self.polling_workers == 0 {
            return Err(BelfryError::Config(
                "polling_workers must be >= 1".to_string(),
            ));
        }
        if self.dispatch_consumers == 0 || self.notify_consumers == 0 {
            return Err(BelfryError::Config(
                "consumer counts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective history retention: never below 7 days.
    pub fn effective_keep_days(&self) -> u32 {
        self.history_keep_days.max(7)
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shard_count(mut self, count: u32) -> Self {
        self.config.shard_count = count;
        self
    }

    pub fn polling_workers(mut self, num: usize) -> Self {
        self.config.polling_workers = num;
        self
    }

    pub fn polling_stagger(mut self, interval: Duration) -> Self {
        self.config.polling_stagger = interval;
        self
    }

    pub fn polling_sleep(mut self, interval: Duration) -> Self {
        self.config.polling_sleep = interval;
        self
    }

    pub fn dispatch_consumers(mut self, num: usize) -> Self {
        self.config.dispatch_consumers = num;
        self
    }

    pub fn dispatch_window(mut self, window: Duration) -> Self {
        self.config.dispatch_window = window;
        self
    }

    pub fn dispatch_sleep(mut self, interval: Duration) -> Self {
        self.config.dispatch_sleep = interval;
        self
    }

    pub fn notify_consumers(mut self, num: usize) -> Self {
        self.config.notify_consumers = num;
        self
    }

    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.config.pool_capacity = capacity;
        self
    }

    pub fn limiter_capacity(mut self, capacity: usize) -> Self {
        self.config.limiter_capacity = capacity;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn stage_grace(mut self, grace: Duration) -> Self {
        self.config.stage_grace = grace;
        self
    }

    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.config.monitor_interval = interval;
        self
    }

    pub fn janitor_interval(mut self, interval: Duration) -> Self {
        self.config.janitor_interval = interval;
        self
    }

    pub fn history_keep_days(mut self, days: u32) -> Self {
        self.config.history_keep_days = days;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::builder()
            .shard_count(16)
            .polling_workers(4)
            .history_keep_days(30)
            .build()
            .unwrap();
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.polling_workers, 4);
        assert_eq!(config.effective_keep_days(), 30);
    }

    #[test]
    fn test_zero_shards_rejected() {
        assert!(EngineConfig::builder().shard_count(0).build().is_err());
    }

    #[test]
    fn test_keep_days_floor() {
        let config = EngineConfig::builder().history_keep_days(1).build().unwrap();
        assert_eq!(config.effective_keep_days(), 7);
    }
}
