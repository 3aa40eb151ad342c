//! Polling stage: claims the current minute slice and fans it out.
//!
//! Every worker on every process races for the same slice each minute; the
//! claim protocol in [`crate::slice`] guarantees exactly one winner fans out.
//! Workers are staggered at startup so a fleet does not tick in lockstep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::bus::{topics, DynMessageBus};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::slice::{bucket_key, minute_slice, ClaimOutcome};
use crate::store::{DynBucketStore, DynSliceStore};

fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

struct PollingInner {
    slices: DynSliceStore,
    buckets: DynBucketStore,
    bus: DynMessageBus,
    stagger: Duration,
    sleep: Duration,
    running: AtomicBool,
}

impl PollingInner {
    // The watch channel latches the close signal, so a worker that is
    // mid-tick when close fires still wakes immediately instead of
    // sleeping out a full polling interval.
    async fn worker_loop(self: Arc<Self>, index: usize, mut shutdown: watch::Receiver<bool>) {
        // Desynchronize worker ticks across the process.
        let warmup = self.stagger * index as u32;
        if !warmup.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(warmup) => {}
                _ = shutdown.changed() => {}
            }
        }

        while self.running.load(Ordering::SeqCst) {
            let now = current_timestamp();
            if let Err(e) = self.poll_once(now).await {
                tracing::error!(worker = index, error = %e, "Polling tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.sleep) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::debug!(worker = index, "Polling worker stopped");
    }

    /// One polling tick: try to claim the slice containing `now`, and fan it
    /// out if won. Returns whether this caller performed the fan-out.
    async fn poll_once(&self, now: i64) -> Result<bool> {
        let slice = minute_slice(now);
        match self.slices.claim_slice(&slice).await? {
            ClaimOutcome::Claimed => {
                tracing::info!(slice = %slice, "Claimed minute slice");
                self.fan_out(&slice).await?;
                Ok(true)
            }
            ClaimOutcome::AlreadyDone | ClaimOutcome::HeldByPeer => Ok(false),
        }
    }

    /// Publish one bucket-ready message per shard, then mark the slice done.
    ///
    /// A publish failure aborts without marking success: already-published
    /// shards will be re-announced when a peer reclaims the slice after the
    /// claim timeout, and dispatch dedupes by removing entries it handles.
    async fn fan_out(&self, slice: &str) -> Result<()> {
        for shard in 0..self.buckets.shard_count() {
            let bucket = bucket_key(shard, slice);
            self.bus.publish(topics::BUCKET_READY, &bucket).await?;
        }
        self.slices.mark_slice_success(slice).await?;
        tracing::info!(slice = %slice, shards = self.buckets.shard_count(), "Fanned out slice");
        Ok(())
    }
}

/// The first pipeline stage. One per engine; spawns `polling_workers` loops.
pub struct PollingStage {
    inner: Arc<PollingInner>,
    workers: usize,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingStage {
    pub fn new(
        slices: DynSliceStore,
        buckets: DynBucketStore,
        bus: DynMessageBus,
        config: &EngineConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(PollingInner {
                slices,
                buckets,
                bus,
                stagger: config.polling_stagger,
                sleep: config.polling_sleep,
                running: AtomicBool::new(false),
            }),
            workers: config.polling_workers,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        let mut handles = self.handles.lock().await;
        for index in 0..self.workers {
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(self.inner.clone().worker_loop(index, shutdown)));
        }
        tracing::info!(workers = self.workers, "Polling stage started");
    }

    /// Stop the workers and wait for them to exit.
    pub async fn close(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Polling worker panicked");
            }
        }
        tracing::info!("Polling stage stopped");
    }
}
