//! Notify stage: fires callbacks for dispatched timers.
//!
//! Consumes timer-fire messages, invokes the definition's HTTP callback
//! under the traffic limiter and its per-call deadline, records a run
//! history row, and re-registers the next occurrence for repeating timers.
//! Re-registration happens before the callback completes, so a slow
//! endpoint cannot delay the definition's next fire.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::bus::{topics, ConsumerHandle, DynMessageBus, MessageHandler};
use crate::callback::CallbackInvoker;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::limiter::TrafficLimiter;
use crate::metrics::DynMetricsSink;
use crate::pool::TaskPool;
use crate::slice::shard_for;
use crate::store::{DynBucketStore, DynDefinitionStore, DynHistoryStore};
use crate::timer::{
    format_time, DeleteType, RunHistory, RunStatus, TimerDefinition, TimerType, TriggerType,
};

const CONSUMER_GROUP: &str = "belfry.notify";

fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn current_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Payload published on the alert topic when a callback fails.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct AlertMessage {
    pub def_id: String,
    pub name: String,
    pub creator: String,
    pub error: String,
}

struct NotifyInner {
    defs: DynDefinitionStore,
    buckets: DynBucketStore,
    history: DynHistoryStore,
    bus: DynMessageBus,
    invoker: Arc<dyn CallbackInvoker>,
    limiter: TrafficLimiter,
    pool: TaskPool,
    metrics: DynMetricsSink,
}

impl NotifyInner {
    /// Full fire protocol for one dispatched definition.
    async fn fire(self: &Arc<Self>, def_id: &str) -> Result<()> {
        let now = current_timestamp();

        // The pending mark covers the dispatch pipeline, not the callback.
        // It comes off as soon as the fire reaches this stage, whatever
        // becomes of the definition afterwards.
        let task = self.buckets.load_save_task(def_id).await?;
        if let Some(task) = &task {
            self.buckets
                .remove_pending(def_id, task.unix_time_nanos, task.trigger_time)
                .await?;
        }

        let Some(def) = self.defs.get(def_id).await? else {
            // Deleted between dispatch and fire; drop the stale save task.
            tracing::warn!(def_id = %def_id, "Fired timer no longer exists");
            self.buckets.delete_save_task(def_id).await?;
            return Ok(());
        };

        if !def.eligible_at(now) {
            tracing::info!(def_id = %def_id, name = %def.name, "Skipping ineligible timer");
            self.buckets.delete_save_task(def_id).await?;
            return Ok(());
        }

        let trigger_time = task.as_ref().map(|t| t.trigger_time).unwrap_or(now);
        self.submit_callback(def.clone(), trigger_time, now);
        self.register_next(&def, now).await
    }

    /// Run the callback on the pool, limiter-gated, and record the outcome.
    fn submit_callback(self: &Arc<Self>, def: TimerDefinition, trigger_time: i64, fired_at: i64) {
        let inner = self.clone();
        let submitted = self.pool.try_spawn(async move {
            inner.invoke_and_record(&def, trigger_time, fired_at).await;
        });
        if let Err(e) = submitted {
            // Shed rather than block the consumer; the fire is still
            // visible as a missing history row.
            tracing::error!(error = %e, "Worker pool full, callback shed");
            self.metrics.trigger_failed();
        }
    }

    async fn invoke_and_record(&self, def: &TimerDefinition, trigger_time: i64, fired_at: i64) {
        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::error!(def_id = %def.def_id, error = %e, "Traffic limiter unavailable");
                return;
            }
        };

        let mut row = RunHistory::new(&def.def_id, &def.name, fired_at);
        if let Err(e) = self.history.create(&row).await {
            tracing::error!(def_id = %def.def_id, error = %e, "Failed to create history row");
        }

        let deadline = Duration::from_secs(def.effective_time_limit());
        let started = tokio::time::Instant::now();
        let outcome = self.invoker.call(&def.notify_http_param, deadline).await;

        // Cost is measured from the scheduled fire time. A skewed clock can
        // make that negative, in which case fall back to the send duration.
        let mut cost = (current_nanos() - trigger_time * 1_000_000_000) / 1_000_000;
        if cost < 0 {
            cost = started.elapsed().as_millis() as i64;
        }
        row.cost_time_ms = cost;

        match outcome {
            Ok(body) => {
                row.status = RunStatus::Succeed;
                row.output = body;
                self.metrics.trigger();
                self.metrics
                    .trigger_latency_ms((fired_at * 1000 - trigger_time * 1000).max(0));
                tracing::info!(
                    def_id = %def.def_id,
                    name = %def.name,
                    cost_ms = row.cost_time_ms,
                    "Callback succeeded"
                );
            }
            Err(e) => {
                row.status = if e.timed_out {
                    RunStatus::Timeout
                } else {
                    RunStatus::Failed
                };
                row.output = e.message.clone();
                self.metrics.trigger_failed();
                tracing::error!(
                    def_id = %def.def_id,
                    name = %def.name,
                    timed_out = e.timed_out,
                    error = %e.message,
                    "Callback failed"
                );
                self.publish_alert(def, &e.message).await;
            }
        }

        if let Err(e) = self.history.update(&row).await {
            tracing::error!(def_id = %def.def_id, error = %e, "Failed to update history row");
        }
    }

    async fn publish_alert(&self, def: &TimerDefinition, error: &str) {
        let alert = AlertMessage {
            def_id: def.def_id.clone(),
            name: def.name.clone(),
            creator: def.creator.clone(),
            error: error.to_string(),
        };
        let payload = match serde_json::to_string(&alert) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode alert");
                return;
            }
        };
        if let Err(e) = self.bus.publish(topics::ALERT, &payload).await {
            tracing::error!(def_id = %def.def_id, error = %e, "Failed to publish alert");
        }
    }

    /// Schedule the definition's next occurrence, or retire it.
    async fn register_next(&self, def: &TimerDefinition, now: i64) -> Result<()> {
        self.buckets.delete_save_task(&def.def_id).await?;

        match def.timer_type {
            TimerType::Delay => {
                if def.delete_type == DeleteType::TriggerDelete {
                    tracing::info!(def_id = %def.def_id, "Deleting one-shot timer after fire");
                    self.defs.delete(&def.def_id).await?;
                }
                Ok(())
            }
            TimerType::Cron => {
                if def.trigger_type == TriggerType::Once {
                    return Ok(());
                }
                match def.next_occurrence(now)? {
                    Some(next) if def.eligible_at(next) => {
                        let shard = shard_for(&def.def_id, self.buckets.shard_count());
                        self.buckets.register(shard, next, &def.def_id).await?;
                        tracing::info!(
                            def_id = %def.def_id,
                            next = %format_time(next),
                            "Re-registered timer"
                        );
                        Ok(())
                    }
                    _ => {
                        tracing::info!(def_id = %def.def_id, "Timer has no further occurrences");
                        Ok(())
                    }
                }
            }
        }
    }
}

/// The third pipeline stage: timer-fire consumers.
pub struct NotifyStage {
    inner: Arc<NotifyInner>,
    bus: DynMessageBus,
    consumers: usize,
    handles: Mutex<Vec<Box<dyn ConsumerHandle>>>,
}

impl NotifyStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        defs: DynDefinitionStore,
        buckets: DynBucketStore,
        history: DynHistoryStore,
        bus: DynMessageBus,
        invoker: Arc<dyn CallbackInvoker>,
        pool: TaskPool,
        metrics: DynMetricsSink,
        config: &EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(NotifyInner {
                defs,
                buckets,
                history,
                bus: bus.clone(),
                invoker,
                limiter: TrafficLimiter::new(config.limiter_capacity),
                pool,
                metrics,
            }),
            bus,
            consumers: config.notify_consumers,
            handles: Mutex::new(Vec::new()),
        }
    }

    fn handler(&self) -> MessageHandler {
        let inner = self.inner.clone();
        Arc::new(move |def_id: String| {
            let inner = inner.clone();
            Box::pin(async move { inner.fire(&def_id).await })
        })
    }

    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        for _ in 0..self.consumers {
            let handle = self
                .bus
                .subscribe(topics::TIMER_FIRE, CONSUMER_GROUP, self.handler())
                .await?;
            handles.push(handle);
        }
        tracing::info!(consumers = self.consumers, "Notify stage started");
        Ok(())
    }

    /// Stop consuming fires. In-flight callbacks keep running on the pool
    /// and are drained by the engine.
    pub async fn close(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.close().await {
                tracing::error!(error = %e, "Failed to close notify consumer");
            }
        }
        tracing::info!("Notify stage stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, MessageBus};
    use crate::callback::{CallbackError, CallbackResult};
    use crate::memory::MemoryStore;
    use crate::metrics::testing::RecordingSink;
    use crate::store::{BucketStore, DefinitionStore, HistoryStore};
    use crate::timer::{NotifyHttpParam, TimerStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Script {
        Succeed,
        Fail,
        TimeOut,
    }

    struct ScriptedInvoker {
        script: Script,
        calls: AtomicUsize,
    }

    impl ScriptedInvoker {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CallbackInvoker for ScriptedInvoker {
        async fn call(&self, _param: &NotifyHttpParam, _deadline: Duration) -> CallbackResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Succeed => Ok("ok".to_string()),
                Script::Fail => Err(CallbackError::failed("callback returned 500")),
                Script::TimeOut => Err(CallbackError::timeout("deadline exceeded")),
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        bus: Arc<InMemoryBus>,
        metrics: Arc<RecordingSink>,
        stage: NotifyStage,
    }

    fn fixture(invoker: Arc<dyn CallbackInvoker>) -> Fixture {
        let store = Arc::new(MemoryStore::new(4));
        let bus = Arc::new(InMemoryBus::new());
        let metrics = Arc::new(RecordingSink::default());
        let stage = NotifyStage::new(
            store.clone(),
            store.clone(),
            store.clone(),
            bus.clone(),
            invoker,
            TaskPool::new(8),
            metrics.clone(),
            &EngineConfig::default(),
        );
        Fixture {
            store,
            bus,
            metrics,
            stage,
        }
    }

    fn enabled_cron_def() -> TimerDefinition {
        let mut def = TimerDefinition::new("billing", "invoice-sync");
        def.status = TimerStatus::Enabled;
        def.cron = "0 */1 * * * ? *".to_string();
        def.notify_http_param.url = "http://example.com/hook".to_string();
        def.notify_http_param.method = "POST".to_string();
        def
    }

    async fn register_now(store: &MemoryStore, def: &TimerDefinition) -> i64 {
        let now = current_timestamp();
        let shard = shard_for(&def.def_id, 4);
        store.register(shard, now, &def.def_id).await.unwrap();
        now
    }

    #[tokio::test]
    async fn test_fire_success_records_history_and_reregisters() {
        let fx = fixture(ScriptedInvoker::new(Script::Succeed));
        let def = enabled_cron_def();
        DefinitionStore::create(fx.store.as_ref(), &def).await.unwrap();
        let now = register_now(&fx.store, &def).await;
        assert_eq!(fx.store.count_pending(now).await.unwrap(), 1);

        fx.stage.inner.fire(&def.def_id).await.unwrap();
        assert_eq!(fx.stage.inner.pool.drain(Duration::from_secs(2)).await, 0);

        let rows = HistoryStore::page_query(fx.store.as_ref(), &def.def_id, 0, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, RunStatus::Succeed);
        assert_eq!(rows[0].output, "ok");

        // Pending mark gone, next occurrence registered.
        assert_eq!(fx.store.count_pending(now).await.unwrap(), 0);
        let task = fx.store.load_save_task(&def.def_id).await.unwrap().unwrap();
        assert!(task.trigger_time > now);
        assert_eq!(fx.metrics.triggers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fire_failure_alerts_and_counts() {
        let fx = fixture(ScriptedInvoker::new(Script::Fail));
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let seen = alerts.clone();
        let _h = fx
            .bus
            .subscribe(
                topics::ALERT,
                "g",
                Arc::new(move |payload| {
                    let seen = seen.clone();
                    Box::pin(async move {
                        seen.lock().await.push(payload);
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();

        let def = enabled_cron_def();
        DefinitionStore::create(fx.store.as_ref(), &def).await.unwrap();
        register_now(&fx.store, &def).await;

        fx.stage.inner.fire(&def.def_id).await.unwrap();
        assert_eq!(fx.stage.inner.pool.drain(Duration::from_secs(2)).await, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let rows = HistoryStore::page_query(fx.store.as_ref(), &def.def_id, 0, 10)
            .await
            .unwrap();
        assert_eq!(rows[0].status, RunStatus::Failed);
        assert_eq!(fx.metrics.failures.load(Ordering::SeqCst), 1);

        let alerts = alerts.lock().await;
        assert_eq!(alerts.len(), 1);
        let alert: AlertMessage = serde_json::from_str(&alerts[0]).unwrap();
        assert_eq!(alert.def_id, def.def_id);
    }

    #[tokio::test]
    async fn test_fire_timeout_is_classified() {
        let fx = fixture(ScriptedInvoker::new(Script::TimeOut));
        let def = enabled_cron_def();
        DefinitionStore::create(fx.store.as_ref(), &def).await.unwrap();
        register_now(&fx.store, &def).await;

        fx.stage.inner.fire(&def.def_id).await.unwrap();
        assert_eq!(fx.stage.inner.pool.drain(Duration::from_secs(2)).await, 0);

        let rows = HistoryStore::page_query(fx.store.as_ref(), &def.def_id, 0, 10)
            .await
            .unwrap();
        assert_eq!(rows[0].status, RunStatus::Timeout);
    }

    #[tokio::test]
    async fn test_disabled_timer_is_skipped() {
        let invoker = ScriptedInvoker::new(Script::Succeed);
        let fx = fixture(invoker.clone());
        let mut def = enabled_cron_def();
        def.status = TimerStatus::Disabled;
        DefinitionStore::create(fx.store.as_ref(), &def).await.unwrap();
        register_now(&fx.store, &def).await;

        fx.stage.inner.fire(&def.def_id).await.unwrap();
        assert_eq!(fx.stage.inner.pool.drain(Duration::from_secs(2)).await, 0);

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
        assert!(fx.store.load_save_task(&def.def_id).await.unwrap().is_none());
        assert_eq!(HistoryStore::count(fx.store.as_ref(), &def.def_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_once_timer_does_not_reregister() {
        let fx = fixture(ScriptedInvoker::new(Script::Succeed));
        let mut def = enabled_cron_def();
        def.trigger_type = TriggerType::Once;
        DefinitionStore::create(fx.store.as_ref(), &def).await.unwrap();
        register_now(&fx.store, &def).await;

        fx.stage.inner.fire(&def.def_id).await.unwrap();
        assert_eq!(fx.stage.inner.pool.drain(Duration::from_secs(2)).await, 0);
        assert!(fx.store.load_save_task(&def.def_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delay_trigger_delete_removes_definition() {
        let fx = fixture(ScriptedInvoker::new(Script::Succeed));
        let mut def = enabled_cron_def();
        def.timer_type = TimerType::Delay;
        def.trigger_type = TriggerType::Once;
        def.delete_type = DeleteType::TriggerDelete;
        def.delay_time = format_time(current_timestamp());
        DefinitionStore::create(fx.store.as_ref(), &def).await.unwrap();
        register_now(&fx.store, &def).await;

        fx.stage.inner.fire(&def.def_id).await.unwrap();
        assert_eq!(fx.stage.inner.pool.drain(Duration::from_secs(2)).await, 0);
        assert!(fx.store.get(&def.def_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_definition_is_tolerated() {
        let fx = fixture(ScriptedInvoker::new(Script::Succeed));
        fx.stage.inner.fire("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_definition_clears_pending_mark() {
        let fx = fixture(ScriptedInvoker::new(Script::Succeed));
        let now = current_timestamp();
        // Registered, then the definition was deleted before the fire.
        fx.store.register(1, now, "ghost").await.unwrap();
        assert_eq!(fx.store.count_pending(now).await.unwrap(), 1);

        fx.stage.inner.fire("ghost").await.unwrap();

        assert_eq!(fx.store.count_pending(now).await.unwrap(), 0);
        assert!(fx.store.load_save_task("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consumer_flow_end_to_end() {
        let fx = fixture(ScriptedInvoker::new(Script::Succeed));
        fx.stage.start().await.unwrap();

        let def = enabled_cron_def();
        DefinitionStore::create(fx.store.as_ref(), &def).await.unwrap();
        register_now(&fx.store, &def).await;
        fx.bus.publish(topics::TIMER_FIRE, &def.def_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.stage.close().await;
        assert_eq!(HistoryStore::count(fx.store.as_ref(), &def.def_id).await.unwrap(), 1);
    }
}
