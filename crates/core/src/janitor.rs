//! Run-history retention janitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::store::DynHistoryStore;

fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

struct JanitorInner {
    history: DynHistoryStore,
    interval: Duration,
    keep_days: u32,
    running: AtomicBool,
    closed: Notify,
}

impl JanitorInner {
    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => self.purge().await,
                _ = self.closed.notified() => break,
            }
        }
        tracing::debug!("Janitor stopped");
    }

    async fn purge(&self) {
        // Cutoff at a day boundary so repeated runs within a day are no-ops.
        let cutoff = current_timestamp() - i64::from(self.keep_days) * 86_400;
        let cutoff = cutoff - cutoff.rem_euclid(86_400);
        match self.history.delete_older_than(cutoff).await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, keep_days = self.keep_days, "Purged run history"),
            Err(e) => tracing::error!(error = %e, "History purge failed"),
        }
    }
}

/// Periodically deletes run-history rows older than the retention window.
pub struct JanitorLoop {
    inner: Arc<JanitorInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JanitorLoop {
    pub fn new(history: DynHistoryStore, interval: Duration, keep_days: u32) -> Self {
        Self {
            inner: Arc::new(JanitorInner {
                history,
                interval,
                keep_days,
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
                tracing::error!(error = %e, "Janitor task panicked");
            }
        }
    }
}
