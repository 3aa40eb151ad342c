//! Dispatch stage: turns a bucket-ready announcement into per-timer fires.
//!
//! Consumers receive one message per `(shard, minute)` bucket and run a scan
//! loop over that bucket for the rest of its minute, publishing a timer-fire
//! message for every due entry and removing it. Entries are removed only
//! after a successful publish, so a broker hiccup retries on the next pass
//! instead of dropping the fire.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::bus::{topics, ConsumerHandle, DynMessageBus, MessageHandler};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::pool::TaskPool;
use crate::slice::{parse_bucket_key, slice_start};
use crate::store::DynBucketStore;

const CONSUMER_GROUP: &str = "belfry.dispatch";

/// A bucket holds exactly one minute of occurrences.
const BUCKET_SPAN_SECS: i64 = 60;

fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

struct DispatchInner {
    buckets: DynBucketStore,
    bus: DynMessageBus,
    pool: TaskPool,
    window: Duration,
    sleep: Duration,
}

impl DispatchInner {
    /// Scan loop for one bucket. Each pass fires everything from the minute
    /// start through the lookahead window; the loop ends only once the
    /// bucket's whole minute has elapsed, regardless of the window length,
    /// so a late-arriving announcement still drains the whole bucket.
    async fn handle_bucket(&self, bucket: &str) -> Result<()> {
        let (_, slice) = parse_bucket_key(bucket)?;
        let start = slice_start(&slice)?;
        let end = start + BUCKET_SPAN_SECS;

        loop {
            let now = current_timestamp();
            let ahead = now.saturating_add(self.window.as_secs() as i64);
            self.scan_pass(bucket, start, ahead.min(end)).await?;
            if now >= end {
                return Ok(());
            }
            tokio::time::sleep(self.sleep).await;
        }
    }

    async fn scan_pass(&self, bucket: &str, start: i64, end: i64) -> Result<()> {
        let due = self.buckets.scan_due(bucket, start, end).await?;
        for def_id in due {
            match self.bus.publish(topics::TIMER_FIRE, &def_id).await {
                Ok(_) => {
                    // The fire is already published; a failed remove costs a
                    // tolerated duplicate, not the rest of the bucket.
                    if let Err(e) = self.buckets.remove(bucket, &def_id).await {
                        tracing::warn!(bucket = %bucket, def_id = %def_id, error = %e, "Failed to remove dispatched entry");
                    }
                    tracing::info!(bucket = %bucket, def_id = %def_id, "Dispatched timer");
                }
                Err(e) => {
                    // Left in the bucket; the next pass retries it.
                    tracing::error!(bucket = %bucket, def_id = %def_id, error = %e, "Dispatch publish failed");
                }
            }
        }
        Ok(())
    }
}

/// The second pipeline stage: bucket-ready consumers.
pub struct DispatchStage {
    inner: Arc<DispatchInner>,
    bus: DynMessageBus,
    consumers: usize,
    handles: Mutex<Vec<Box<dyn ConsumerHandle>>>,
}

impl DispatchStage {
    pub fn new(
        buckets: DynBucketStore,
        bus: DynMessageBus,
        pool: TaskPool,
        config: &EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                buckets,
                bus: bus.clone(),
                pool,
                window: config.dispatch_window,
                sleep: config.dispatch_sleep,
            }),
            bus,
            consumers: config.dispatch_consumers,
            handles: Mutex::new(Vec::new()),
        }
    }

    fn handler(&self) -> MessageHandler {
        let inner = self.inner.clone();
        Arc::new(move |bucket: String| {
            let inner = inner.clone();
            Box::pin(async move {
                let scan_inner = inner.clone();
                let scan_bucket = bucket.clone();
                let submitted = inner.pool.try_spawn(async move {
                    if let Err(e) = scan_inner.handle_bucket(&scan_bucket).await {
                        tracing::error!(bucket = %scan_bucket, error = %e, "Bucket scan failed");
                    }
                });
                if submitted.is_err() {
                    // Pool is saturated; scan inline rather than drop the
                    // bucket (the slice is already marked fanned out).
                    tracing::warn!(bucket = %bucket, "Worker pool full, scanning inline");
                    inner.handle_bucket(&bucket).await?;
                }
                Ok(())
            })
        })
    }

    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        for _ in 0..self.consumers {
            let handle = self
                .bus
                .subscribe(topics::BUCKET_READY, CONSUMER_GROUP, self.handler())
                .await?;
            handles.push(handle);
        }
        tracing::info!(consumers = self.consumers, "Dispatch stage started");
        Ok(())
    }

    /// Stop consuming bucket announcements. In-flight scan loops keep
    /// running on the pool and are drained by the engine.
    pub async fn close(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.close().await {
                tracing::error!(error = %e, "Failed to close dispatch consumer");
            }
        }
        tracing::info!("Dispatch stage stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, MessageBus};
    use crate::error::BelfryError;
    use crate::memory::MemoryStore;
    use crate::slice::{bucket_key, minute_slice, shard_for};
    use crate::store::BucketStore;
    use crate::timer::SaveTask;
    use async_trait::async_trait;

    fn short_config() -> EngineConfig {
        EngineConfig::builder()
            .dispatch_window(Duration::from_secs(1))
            .dispatch_sleep(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    fn collecting(seen: Arc<Mutex<Vec<String>>>) -> MessageHandler {
        Arc::new(move |payload| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().await.push(payload);
                Ok(())
            })
        })
    }

    /// Delegates to a real store but refuses every bucket removal.
    struct RemoveRefusingStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl BucketStore for RemoveRefusingStore {
        fn shard_count(&self) -> u32 {
            self.inner.shard_count()
        }

        async fn register(&self, shard: u32, trigger_time: i64, def_id: &str) -> Result<()> {
            self.inner.register(shard, trigger_time, def_id).await
        }

        async fn scan_due(&self, bucket: &str, start: i64, end: i64) -> Result<Vec<String>> {
            self.inner.scan_due(bucket, start, end).await
        }

        async fn remove(&self, _bucket: &str, _def_id: &str) -> Result<()> {
            Err(BelfryError::Backend("zrem refused".to_string()))
        }

        async fn not_triggered(&self, bucket: &str) -> Result<Vec<String>> {
            self.inner.not_triggered(bucket).await
        }

        async fn load_save_task(&self, def_id: &str) -> Result<Option<SaveTask>> {
            self.inner.load_save_task(def_id).await
        }

        async fn delete_save_task(&self, def_id: &str) -> Result<()> {
            self.inner.delete_save_task(def_id).await
        }

        async fn remove_pending(&self, def_id: &str, nanos: i64, trigger_time: i64) -> Result<()> {
            self.inner.remove_pending(def_id, nanos, trigger_time).await
        }

        async fn count_pending(&self, now: i64) -> Result<usize> {
            self.inner.count_pending(now).await
        }
    }

    /// Top of a minute that has fully elapsed, so `handle_bucket` completes
    /// in one pass instead of looping for the rest of a live minute.
    fn past_minute_start() -> i64 {
        let then = current_timestamp() - 120;
        then - then % 60
    }

    #[tokio::test]
    async fn test_handle_bucket_fires_due_and_removes() {
        let store = Arc::new(MemoryStore::new(4));
        let bus = Arc::new(InMemoryBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _h = bus
            .subscribe(topics::TIMER_FIRE, "g", collecting(seen.clone()))
            .await
            .unwrap();

        let start = past_minute_start();
        let shard = shard_for("def-a", 4);
        store.register(shard, start, "def-a").await.unwrap();

        let stage = DispatchStage::new(store.clone(), bus, TaskPool::new(4), &short_config());
        let bucket = bucket_key(shard, &minute_slice(start));
        stage.inner.handle_bucket(&bucket).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().await.clone(), vec!["def-a".to_string()]);
        assert!(store.not_triggered(&bucket).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_window_still_covers_whole_minute() {
        let store = Arc::new(MemoryStore::new(4));
        let bus = Arc::new(InMemoryBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _h = bus
            .subscribe(topics::TIMER_FIRE, "g", collecting(seen.clone()))
            .await
            .unwrap();

        // Due well past the 1-second scan window of `short_config`.
        let start = past_minute_start();
        store.register(0, start + 50, "def-late").await.unwrap();

        let stage = DispatchStage::new(store.clone(), bus, TaskPool::new(4), &short_config());
        let bucket = bucket_key(0, &minute_slice(start));
        stage.inner.handle_bucket(&bucket).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().await.clone(), vec!["def-late".to_string()]);
        assert!(store.not_triggered(&bucket).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_failure_does_not_abort_scan() {
        let memory = Arc::new(MemoryStore::new(4));
        let store = Arc::new(RemoveRefusingStore {
            inner: memory.clone(),
        });
        let bus = Arc::new(InMemoryBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _h = bus
            .subscribe(topics::TIMER_FIRE, "g", collecting(seen.clone()))
            .await
            .unwrap();

        let start = past_minute_start();
        store.register(0, start + 1, "def-a").await.unwrap();
        store.register(0, start + 2, "def-b").await.unwrap();

        let stage = DispatchStage::new(store, bus, TaskPool::new(4), &short_config());
        let bucket = bucket_key(0, &minute_slice(start));
        stage
            .inner
            .scan_pass(&bucket, start, start + 60)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut fired = seen.lock().await.clone();
        fired.sort();
        assert_eq!(fired, vec!["def-a".to_string(), "def-b".to_string()]);
    }

    #[tokio::test]
    async fn test_future_entries_in_minute_stay_put() {
        let store = Arc::new(MemoryStore::new(4));
        let bus = Arc::new(InMemoryBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _h = bus
            .subscribe(topics::TIMER_FIRE, "g", collecting(seen.clone()))
            .await
            .unwrap();

        // Due far beyond the (shortened) scan window.
        let now = current_timestamp();
        store.register(0, now + 3600, "def-later").await.unwrap();

        let stage = DispatchStage::new(store.clone(), bus, TaskPool::new(4), &short_config());
        let bucket = bucket_key(0, &minute_slice(now + 3600));
        // Scan the bucket's own window, which has not opened yet.
        stage
            .inner
            .scan_pass(&bucket, now - 1, now)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(seen.lock().await.is_empty());
        assert_eq!(
            store.not_triggered(&bucket).await.unwrap(),
            vec!["def-later".to_string()]
        );
    }

    #[tokio::test]
    async fn test_consumer_flow_end_to_end() {
        let store = Arc::new(MemoryStore::new(4));
        let bus = Arc::new(InMemoryBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _h = bus
            .subscribe(topics::TIMER_FIRE, "g", collecting(seen.clone()))
            .await
            .unwrap();

        let stage = DispatchStage::new(store.clone(), bus.clone(), TaskPool::new(4), &short_config());
        stage.start().await.unwrap();

        let now = current_timestamp();
        let start = now - now % 60;
        store.register(2, start, "def-e2e").await.unwrap();
        bus.publish(topics::BUCKET_READY, &bucket_key(2, &minute_slice(start)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        stage.close().await;
        assert_eq!(seen.lock().await.clone(), vec!["def-e2e".to_string()]);
    }
}
