//! The timer engine: stage lifecycle and graceful shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::bus::DynMessageBus;
use crate::callback::{CallbackInvoker, HttpCallback};
use crate::config::EngineConfig;
use crate::dispatch::DispatchStage;
use crate::error::{BelfryError, Result};
use crate::janitor::JanitorLoop;
use crate::metrics::{DynMetricsSink, LogSink};
use crate::monitor::MonitorLoop;
use crate::notify::NotifyStage;
use crate::polling::PollingStage;
use crate::pool::TaskPool;
use crate::service::TimerService;
use crate::store::{DynBucketStore, DynDefinitionStore, DynHistoryStore, DynSliceStore};

/// Runs the three-stage pipeline plus the monitor and janitor loops.
///
/// Stages start consumers-first so nothing published is unreceivable, and
/// stop producers-first so in-flight work drains instead of piling up.
pub struct TimerEngine {
    config: EngineConfig,
    pool: TaskPool,
    polling: PollingStage,
    dispatch: DispatchStage,
    notify: NotifyStage,
    monitor: MonitorLoop,
    janitor: JanitorLoop,
    defs: DynDefinitionStore,
    buckets: DynBucketStore,
    history: DynHistoryStore,
    invoker: Arc<dyn CallbackInvoker>,
}

impl TimerEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// A service sharing this engine's stores and callback invoker.
    pub fn service(&self) -> TimerService {
        TimerService::new(
            self.defs.clone(),
            self.buckets.clone(),
            self.history.clone(),
            self.invoker.clone(),
        )
    }

    pub async fn start(&self) -> Result<()> {
        self.notify.start().await?;
        self.dispatch.start().await?;
        self.monitor.start().await;
        self.janitor.start().await;
        self.polling.start().await;
        tracing::info!("Timer engine started");
        Ok(())
    }

    /// Graceful shutdown within `shutdown_timeout`: stop claiming slices,
    /// stop each consumer stage in pipeline order, then drain the pool.
    pub async fn stop(&self) {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        tracing::info!("Timer engine stopping");

        self.polling.close().await;

        self.dispatch.close().await;
        // In-flight bucket scans may run to the end of their minute; give
        // them the stage grace before cutting off the notify consumers.
        let grace = self.config.stage_grace.min(remaining(deadline));
        self.pool.drain(grace).await;

        self.notify.close().await;
        let stuck = self.pool.drain(remaining(deadline)).await;
        if stuck > 0 {
            tracing::warn!(stuck, "Shutdown deadline reached with tasks in flight");
        }

        self.monitor.close().await;
        self.janitor.close().await;
        tracing::info!("Timer engine stopped");
    }

    /// Start the engine, run until `shutdown` resolves, then stop.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await;
        Ok(())
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Builder for [`TimerEngine`]. Stores and the bus are required; the
/// invoker defaults to HTTP and the metrics sink to structured logs.
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    slices: Option<DynSliceStore>,
    buckets: Option<DynBucketStore>,
    defs: Option<DynDefinitionStore>,
    history: Option<DynHistoryStore>,
    bus: Option<DynMessageBus>,
    invoker: Option<Arc<dyn CallbackInvoker>>,
    metrics: Option<DynMetricsSink>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn slice_store(mut self, store: DynSliceStore) -> Self {
        self.slices = Some(store);
        self
    }

    pub fn bucket_store(mut self, store: DynBucketStore) -> Self {
        self.buckets = Some(store);
        self
    }

    pub fn definition_store(mut self, store: DynDefinitionStore) -> Self {
        self.defs = Some(store);
        self
    }

    pub fn history_store(mut self, store: DynHistoryStore) -> Self {
        self.history = Some(store);
        self
    }

    pub fn bus(mut self, bus: DynMessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn invoker(mut self, invoker: Arc<dyn CallbackInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn metrics(mut self, metrics: DynMetricsSink) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<TimerEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let slices = require(self.slices, "slice store")?;
        let buckets = require(self.buckets, "bucket store")?;
        let defs = require(self.defs, "definition store")?;
        let history = require(self.history, "history store")?;
        let bus = require(self.bus, "message bus")?;
        let invoker: Arc<dyn CallbackInvoker> =
            self.invoker.unwrap_or_else(|| Arc::new(HttpCallback::new()));
        let metrics: DynMetricsSink = self.metrics.unwrap_or_else(|| Arc::new(LogSink));

        let pool = TaskPool::new(config.pool_capacity);
        let polling = PollingStage::new(slices, buckets.clone(), bus.clone(), &config);
        let dispatch = DispatchStage::new(buckets.clone(), bus.clone(), pool.clone(), &config);
        let notify = NotifyStage::new(
            defs.clone(),
            buckets.clone(),
            history.clone(),
            bus,
            invoker.clone(),
            pool.clone(),
            metrics.clone(),
            &config,
        );
        let monitor = MonitorLoop::new(
            defs.clone(),
            buckets.clone(),
            metrics,
            config.monitor_interval,
        );
        let janitor = JanitorLoop::new(
            history.clone(),
            config.janitor_interval,
            config.effective_keep_days(),
        );

        Ok(TimerEngine {
            config,
            pool,
            polling,
            dispatch,
            notify,
            monitor,
            janitor,
            defs,
            buckets,
            history,
            invoker,
        })
    }
}

fn require<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| BelfryError::Config(format!("{} is required", what)))
}
