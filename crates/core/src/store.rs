//! Capability traits for the shared stores.
//!
//! One trait per stage concern (slice claims, buckets, definitions, run
//! history), each implemented by a storage adapter crate. The scheduling
//! layer only ever talks to these traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::slice::ClaimOutcome;
use crate::timer::{RunHistory, SaveTask, TimerDefinition, TimerStatus};

/// Exactly-once minute-slice claims (spec'd in [`crate::slice`]).
#[async_trait]
pub trait SliceStore: Send + Sync {
    /// Attempt to claim a minute slice for fan-out. Losing the claim is a
    /// routine outcome, not an error; errors are infrastructure failures.
    async fn claim_slice(&self, slice: &str) -> Result<ClaimOutcome>;

    /// Mark a slice fully fanned out. Returns `SliceCompleted` if the slice
    /// was already marked, which guards against double completion.
    async fn mark_slice_success(&self, slice: &str) -> Result<()>;
}

/// Sharded per-minute buckets of due timers, plus the save-task and
/// pending-mark accounting that rides along with registration.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Configured shard count. Operationally increase-only: shrinking it
    /// orphans buckets above the new count.
    fn shard_count(&self) -> u32;

    /// Register an occurrence into `(shard, minute_slice(trigger_time))`,
    /// scored by the exact trigger second. Overwrites the definition's
    /// save task and writes a pending mark for the trigger window.
    async fn register(&self, shard: u32, trigger_time: i64, def_id: &str) -> Result<()>;

    /// Due definition IDs in `bucket` with scores in `[start, end]`.
    async fn scan_due(&self, bucket: &str, start: i64, end: i64) -> Result<Vec<String>>;

    /// Remove a dispatched definition from a bucket.
    async fn remove(&self, bucket: &str, def_id: &str) -> Result<()>;

    /// Full scan of a (past) bucket: registered-but-never-dispatched IDs,
    /// for recovery/audit tooling.
    async fn not_triggered(&self, bucket: &str) -> Result<Vec<String>>;

    /// Load the most recent save task for a definition.
    async fn load_save_task(&self, def_id: &str) -> Result<Option<SaveTask>>;

    /// Delete a definition's save task.
    async fn delete_save_task(&self, def_id: &str) -> Result<()>;

    /// Remove the pending mark written for a registration.
    async fn remove_pending(&self, def_id: &str, unix_nanos: i64, trigger_time: i64) -> Result<()>;

    /// Count pending marks in the 10-minute window containing `now`.
    async fn count_pending(&self, now: i64) -> Result<usize>;
}

/// Relational CRUD over timer definitions. Authoritative for definition
/// attributes; the bucket store is authoritative for scheduling state.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn create(&self, def: &TimerDefinition) -> Result<()>;
    async fn get(&self, def_id: &str) -> Result<Option<TimerDefinition>>;
    async fn delete(&self, def_id: &str) -> Result<()>;
    async fn update_status(&self, def_id: &str, status: TimerStatus) -> Result<()>;
    async fn get_by_app_and_name(&self, app: &str, name: &str)
        -> Result<Option<TimerDefinition>>;
    async fn page_query(&self, app: &str, offset: u64, limit: u64)
        -> Result<Vec<TimerDefinition>>;
    async fn count(&self, app: &str) -> Result<u64>;
    async fn count_by_status(&self, status: TimerStatus) -> Result<u64>;
}

/// Append-only run history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn create(&self, row: &RunHistory) -> Result<()>;
    async fn update(&self, row: &RunHistory) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn page_query(&self, def_id: &str, offset: u64, limit: u64) -> Result<Vec<RunHistory>>;
    async fn count(&self, def_id: &str) -> Result<u64>;
    /// Bulk-purge rows with `created_at` older than `cutoff`. Returns the
    /// number of rows removed.
    async fn delete_older_than(&self, cutoff: i64) -> Result<u64>;
}

/// Shared trait objects, as passed into the stages.
pub type DynSliceStore = Arc<dyn SliceStore>;
pub type DynBucketStore = Arc<dyn BucketStore>;
pub type DynDefinitionStore = Arc<dyn DefinitionStore>;
pub type DynHistoryStore = Arc<dyn HistoryStore>;
