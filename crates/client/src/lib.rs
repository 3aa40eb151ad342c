//! # belfry-client - Admin Client for Timer Engine Operations
//!
//! This crate provides an `AdminClient` for monitoring and repairing a
//! belfry deployment from ops tooling, outside the HTTP API.
//!
//! ## Features
//!
//! - **Statistics**: Enabled/disabled timer counts and pending marks
//! - **Slice Audit**: Find occurrences that were registered but never
//!   dispatched in a past minute
//! - **Save Tasks**: Inspect the latest registered occurrence of a timer
//! - **History**: Purge old run history on demand
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use belfry_client::AdminClient;
//! use belfry_redis::RedisStore;
//! use belfry_sqlite::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> belfry_core::Result<()> {
//!     let redis = Arc::new(RedisStore::new("redis://localhost", 4).await?);
//!     let sqlite = Arc::new(SqliteStore::new("sqlite:belfry.db", "belfry").await?);
//!     let admin = AdminClient::new(sqlite.clone(), redis, sqlite);
//!
//!     let stats = admin.stats().await?;
//!     println!("enabled={} pending={}", stats.enabled, stats.pending);
//!
//!     // Audit the minute that just passed
//!     let now = chrono::Utc::now().timestamp();
//!     let missed = admin.audit_slice(now - 60).await?;
//!     for timer in &missed {
//!         println!("never dispatched: {} in {}", timer.def_id, timer.bucket);
//!     }
//!
//!     Ok(())
//! }
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use belfry_core::{
    bucket_key, minute_slice, DynBucketStore, DynDefinitionStore, DynHistoryStore, SaveTask,
    TimerStatus,
};

pub use belfry_core::{BelfryError, Result, RunHistory, TimerDefinition};

/// A snapshot of engine-level counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    /// Number of enabled timer definitions.
    pub enabled: u64,
    /// Number of disabled timer definitions.
    pub disabled: u64,
    /// Pending marks in the 10-minute window containing the sample time.
    pub pending: usize,
}

/// An occurrence that was registered into a bucket but never dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissedTimer {
    /// The timer definition ID.
    pub def_id: String,
    /// The shard the occurrence landed in.
    pub shard: u32,
    /// The full bucket key it was found in.
    pub bucket: String,
}

/// Admin client for monitoring and repairing the timer engine.
///
/// Talks to the stores directly, so it works even when no server process
/// is running. Useful for:
/// - Sampling engine counters
/// - Auditing past minutes for never-dispatched occurrences
/// - Inspecting a timer's latest registered occurrence
/// - Purging old run history
#[derive(Clone)]
pub struct AdminClient {
    defs: DynDefinitionStore,
    buckets: DynBucketStore,
    history: DynHistoryStore,
}

impl AdminClient {
    /// Create a new admin client over the three stores.
    pub fn new(
        defs: DynDefinitionStore,
        buckets: DynBucketStore,
        history: DynHistoryStore,
    ) -> Self {
        Self {
            defs,
            buckets,
            history,
        }
    }

    // ========== Statistics ==========

    /// Sample engine counters at the current time.
    pub async fn stats(&self) -> Result<EngineStats> {
        self.stats_at(current_timestamp()).await
    }

    /// Sample engine counters; `now` picks the pending window.
    pub async fn stats_at(&self, now: i64) -> Result<EngineStats> {
        let enabled = self.defs.count_by_status(TimerStatus::Enabled).await?;
        let disabled = self.defs.count_by_status(TimerStatus::Disabled).await?;
        let pending = self.buckets.count_pending(now).await?;

        Ok(EngineStats {
            enabled,
            disabled,
            pending,
        })
    }

    // ========== Slice Audit ==========

    /// List occurrences that are still sitting in the buckets of the
    /// minute containing `unix_secs`.
    ///
    /// For a past minute this means the dispatch stage never delivered
    /// them, either because the process died mid-scan or because the
    /// slice was claimed and the claimant crashed before fan-out
    /// finished. Entries found here can be re-registered by hand.
    pub async fn audit_slice(&self, unix_secs: i64) -> Result<Vec<MissedTimer>> {
        let slice = minute_slice(unix_secs);
        let mut missed = Vec::new();

        for shard in 0..self.buckets.shard_count() {
            let bucket = bucket_key(shard, &slice);
            for def_id in self.buckets.not_triggered(&bucket).await? {
                missed.push(MissedTimer {
                    def_id,
                    shard,
                    bucket: bucket.clone(),
                });
            }
        }

        if !missed.is_empty() {
            tracing::warn!(
                slice = %slice,
                count = missed.len(),
                "Found never-dispatched occurrences"
            );
        }

        Ok(missed)
    }

    // ========== Save Tasks ==========

    /// Load the latest registered occurrence for a timer, if any.
    pub async fn get_save_task(&self, def_id: &str) -> Result<Option<SaveTask>> {
        self.buckets.load_save_task(def_id).await
    }

    // ========== History ==========

    /// Purge run history older than `keep_days` days. Returns the number
    /// of rows removed.
    pub async fn purge_history(&self, keep_days: u32) -> Result<u64> {
        let cutoff = current_timestamp() - i64::from(keep_days) * 86_400;
        let cutoff = cutoff - cutoff.rem_euclid(86_400);
        let purged = self.history.delete_older_than(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, keep_days, "Purged run history");
        }
        Ok(purged)
    }
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use belfry_core::{
        shard_for, BucketStore, DefinitionStore, HistoryStore, MemoryStore, RunStatus,
    };

    fn client_over(store: Arc<MemoryStore>) -> AdminClient {
        AdminClient::new(store.clone(), store.clone(), store)
    }

    #[test]
    fn test_engine_stats_serialization() {
        let stats = EngineStats {
            enabled: 4,
            disabled: 1,
            pending: 9,
        };

        let json = serde_json::to_string(&stats).unwrap();
        let parsed: EngineStats = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.enabled, 4);
        assert_eq!(parsed.disabled, 1);
        assert_eq!(parsed.pending, 9);
    }

    #[tokio::test]
    async fn test_stats_counts_definitions_and_pending() {
        let store = Arc::new(MemoryStore::new(4));
        let now = current_timestamp();

        let mut def = TimerDefinition::new("billing", "hourly-report");
        def.status = belfry_core::TimerStatus::Enabled;
        DefinitionStore::create(store.as_ref(), &def).await.unwrap();
        let disabled = TimerDefinition::new("billing", "old-report");
        DefinitionStore::create(store.as_ref(), &disabled)
            .await
            .unwrap();

        store
            .register(shard_for(&def.def_id, 4), now, &def.def_id)
            .await
            .unwrap();

        let admin = client_over(store);
        let stats = admin.stats_at(now).await.unwrap();
        assert_eq!(stats.enabled, 1);
        assert_eq!(stats.disabled, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_audit_slice_reports_undelivered() {
        let store = Arc::new(MemoryStore::new(4));
        let minute_ago = current_timestamp() - 60;

        store.register(2, minute_ago, "stuck-timer").await.unwrap();

        let admin = client_over(store.clone());
        let missed = admin.audit_slice(minute_ago).await.unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].def_id, "stuck-timer");
        assert_eq!(missed[0].shard, 2);

        // Dispatched entries no longer show up
        store.remove(&missed[0].bucket, "stuck-timer").await.unwrap();
        assert!(admin.audit_slice(minute_ago).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_slice_empty_minute() {
        let store = Arc::new(MemoryStore::new(4));
        let admin = client_over(store);
        let missed = admin.audit_slice(current_timestamp()).await.unwrap();
        assert!(missed.is_empty());
    }

    #[tokio::test]
    async fn test_get_save_task_round_trip() {
        let store = Arc::new(MemoryStore::new(4));
        let now = current_timestamp();
        store.register(0, now + 30, "t1").await.unwrap();

        let admin = client_over(store);
        let task = admin.get_save_task("t1").await.unwrap().unwrap();
        assert_eq!(task.trigger_time, now + 30);
        assert!(task.bucket_time_id.starts_with("0_"));

        assert!(admin.get_save_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_history_removes_old_rows() {
        let store = Arc::new(MemoryStore::new(4));
        let now = current_timestamp();

        let mut old = RunHistory::new("t1", "nightly-sync", now);
        old.created_at = now - 10 * 86_400;
        old.status = RunStatus::Succeed;
        HistoryStore::create(store.as_ref(), &old).await.unwrap();

        let recent = RunHistory::new("t1", "nightly-sync", now);
        HistoryStore::create(store.as_ref(), &recent).await.unwrap();

        let admin = client_over(store.clone());
        assert_eq!(admin.purge_history(7).await.unwrap(), 1);
        assert_eq!(HistoryStore::count(store.as_ref(), "t1").await.unwrap(), 1);
    }
}
