//! Metrics monitor loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::metrics::DynMetricsSink;
use crate::store::{DynBucketStore, DynDefinitionStore};
use crate::timer::TimerStatus;

fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

struct MonitorInner {
    defs: DynDefinitionStore,
    buckets: DynBucketStore,
    metrics: DynMetricsSink,
    interval: Duration,
    running: AtomicBool,
    closed: Notify,
}

impl MonitorInner {
    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => self.sample().await,
                _ = self.closed.notified() => break,
            }
        }
        tracing::debug!("Monitor stopped");
    }

    async fn sample(&self) {
        match self.defs.count_by_status(TimerStatus::Enabled).await {
            Ok(count) => self.metrics.enabled_timers(count),
            Err(e) => tracing::error!(error = %e, "Failed to count enabled timers"),
        }
        match self.buckets.count_pending(current_timestamp()).await {
            Ok(count) => self.metrics.pending_timers(count as u64),
            Err(e) => tracing::error!(error = %e, "Failed to count pending timers"),
        }
    }
}

/// Periodically publishes the enabled-timer and pending-mark gauges.
pub struct MonitorLoop {
    inner: Arc<MonitorInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorLoop {
    pub fn new(
        defs: DynDefinitionStore,
        buckets: DynBucketStore,
        metrics: DynMetricsSink,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                defs,
                buckets,
                metrics,
                interval,
                running: AtomicBool::new(false),
                closed: Notify::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        let mut handle = self.handle.lock().await;
        *handle = Some(tokio::spawn(self.inner.clone().run()));
    }

    pub async fn close(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.closed.notify_waiters();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Monitor task panicked");
            }
        }
    }
}
