//! # belfry-core - Core types and scheduling pipeline for the timer engine
//!
//! This crate provides the heart of the belfry timer system:
//! - Capability traits (`SliceStore`, `BucketStore`, `DefinitionStore`,
//!   `HistoryStore`, `MessageBus`, `CallbackInvoker`) for the adapters
//! - `TimerDefinition`, `SaveTask`, `RunHistory` and related types
//! - The three pipeline stages: polling, dispatch, notify
//! - `TimerEngine` for lifecycle and graceful shutdown
//! - `TimerService` for the application-facing operations
//! - In-memory store and bus implementations

mod bus;
mod callback;
mod config;
mod cron;
mod dispatch;
mod engine;
mod error;
mod janitor;
mod limiter;
mod memory;
mod metrics;
mod monitor;
mod notify;
mod polling;
mod pool;
mod service;
mod slice;
mod store;
mod timer;

// Re-export main types
pub use bus::{topics, ConsumerHandle, DynMessageBus, InMemoryBus, MessageBus, MessageHandler};
pub use callback::{CallbackError, CallbackInvoker, CallbackResult, HttpCallback};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use cron::CronSchedule;
pub use dispatch::DispatchStage;
pub use engine::{EngineBuilder, TimerEngine};
pub use error::{BelfryError, Result};
pub use janitor::JanitorLoop;
pub use limiter::TrafficLimiter;
pub use memory::{Clock, MemoryStore};
pub use metrics::{DynMetricsSink, LogSink, MetricsSink};
pub use monitor::MonitorLoop;
pub use notify::{AlertMessage, NotifyStage};
pub use polling::PollingStage;
pub use pool::TaskPool;
pub use service::TimerService;
pub use slice::{
    bucket_key, evaluate_claim, minute_slice, parse_bucket_key, pending_member, pending_window,
    shard_for, slice_lock, slice_start, ClaimDecision, ClaimOutcome, CLAIM_LOCK_TTL_MS,
    CLAIM_TIMEOUT_SECS, PENDING_TTL_SECS, SLICE_TTL_SECS, SUCCESS_SENTINEL,
};
pub use store::{
    BucketStore, DefinitionStore, DynBucketStore, DynDefinitionStore, DynHistoryStore,
    DynSliceStore, HistoryStore, SliceStore,
};
pub use timer::{
    format_time, parse_time, DeleteType, NotifyHttpParam, RunHistory, RunStatus, SaveTask,
    TimerDefinition, TimerStatus, TimerType, TriggerType, MAX_EXECUTE_TIME_LIMIT, TIME_FORMAT,
};
