//! In-memory store implementing every storage trait.
//!
//! Backs tests and single-process deployments; the claim protocol runs the
//! same state machine as the distributed adapters, with a process-local
//! mutex standing in for the distributed one. The clock is injectable so
//! claim-timeout behavior can be tested without waiting wall-clock time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{BelfryError, Result};
use crate::slice::{
    bucket_key, evaluate_claim, minute_slice, pending_member, pending_window, ClaimDecision,
    ClaimOutcome, SUCCESS_SENTINEL,
};
use crate::store::{BucketStore, DefinitionStore, HistoryStore, SliceStore};
use crate::timer::{RunHistory, SaveTask, TimerDefinition, TimerStatus};

/// Injectable wall clock, Unix seconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    })
}

#[derive(Default)]
struct Inner {
    slices: HashMap<String, String>,
    /// bucket key -> (def_id -> score)
    buckets: HashMap<String, BTreeMap<String, i64>>,
    save_tasks: HashMap<String, SaveTask>,
    /// pending window key -> members
    pending: HashMap<String, HashSet<String>>,
    defs: HashMap<String, TimerDefinition>,
    history: HashMap<String, RunHistory>,
}

/// In-memory implementation of all four stores.
pub struct MemoryStore {
    shard_count: u32,
    clock: Clock,
    nanos_seq: AtomicI64,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(shard_count: u32) -> Self {
        Self::with_clock(shard_count, system_clock())
    }

    /// Construct with an injected clock (claim-timeout tests).
    pub fn with_clock(shard_count: u32, clock: Clock) -> Self {
        Self {
            shard_count: shard_count.max(1),
            clock,
            nanos_seq: AtomicI64::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Unique per-registration nanosecond stamp derived from the clock.
    fn next_nanos(&self) -> i64 {
        self.now() * 1_000_000_000 + self.nanos_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens after a panicked test.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SliceStore for MemoryStore {
    async fn claim_slice(&self, slice: &str) -> Result<ClaimOutcome> {
        let now = self.now();
        let mut inner = self.lock();
        match evaluate_claim(inner.slices.get(slice).map(String::as_str), now) {
            ClaimDecision::Write(value) => {
                inner.slices.insert(slice.to_string(), value);
                Ok(ClaimOutcome::Claimed)
            }
            ClaimDecision::AlreadyDone => Ok(ClaimOutcome::AlreadyDone),
            ClaimDecision::HeldByPeer => Ok(ClaimOutcome::HeldByPeer),
        }
    }

    async fn mark_slice_success(&self, slice: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.slices.get(slice).map(String::as_str) == Some(SUCCESS_SENTINEL) {
            return Err(BelfryError::SliceCompleted(slice.to_string()));
        }
        inner
            .slices
            .insert(slice.to_string(), SUCCESS_SENTINEL.to_string());
        Ok(())
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    async fn register(&self, shard: u32, trigger_time: i64, def_id: &str) -> Result<()> {
        let bucket = bucket_key(shard, &minute_slice(trigger_time));
        let nanos = self.next_nanos();
        let mut inner = self.lock();
        inner
            .buckets
            .entry(bucket.clone())
            .or_default()
            .insert(def_id.to_string(), trigger_time);
        inner.save_tasks.insert(
            def_id.to_string(),
            SaveTask {
                bucket_time_id: bucket,
                trigger_time,
                unix_time_nanos: nanos,
            },
        );
        inner
            .pending
            .entry(pending_window(trigger_time))
            .or_default()
            .insert(pending_member(def_id, nanos));
        Ok(())
    }

    async fn scan_due(&self, bucket: &str, start: i64, end: i64) -> Result<Vec<String>> {
        let inner = self.lock();
        let Some(entries) = inner.buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<(i64, String)> = entries
            .iter()
            .filter(|(_, score)| **score >= start && **score <= end)
            .map(|(id, score)| (*score, id.clone()))
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn remove(&self, bucket: &str, def_id: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(entries) = inner.buckets.get_mut(bucket) {
            entries.remove(def_id);
        }
        Ok(())
    }

    async fn not_triggered(&self, bucket: &str) -> Result<Vec<String>> {
        let inner = self.lock();
        let Some(entries) = inner.buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        let mut all: Vec<(i64, String)> =
            entries.iter().map(|(id, score)| (*score, id.clone())).collect();
        all.sort();
        Ok(all.into_iter().map(|(_, id)| id).collect())
    }

    async fn load_save_task(&self, def_id: &str) -> Result<Option<SaveTask>> {
        Ok(self.lock().save_tasks.get(def_id).cloned())
    }

    async fn delete_save_task(&self, def_id: &str) -> Result<()> {
        self.lock().save_tasks.remove(def_id);
        Ok(())
    }

    async fn remove_pending(&self, def_id: &str, unix_nanos: i64, trigger_time: i64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(members) = inner.pending.get_mut(&pending_window(trigger_time)) {
            members.remove(&pending_member(def_id, unix_nanos));
        }
        Ok(())
    }

    async fn count_pending(&self, now: i64) -> Result<usize> {
        let inner = self.lock();
        Ok(inner
            .pending
            .get(&pending_window(now))
            .map(HashSet::len)
            .unwrap_or(0))
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn create(&self, def: &TimerDefinition) -> Result<()> {
        self.lock().defs.insert(def.def_id.clone(), def.clone());
        Ok(())
    }

    async fn get(&self, def_id: &str) -> Result<Option<TimerDefinition>> {
        Ok(self.lock().defs.get(def_id).cloned())
    }

    async fn delete(&self, def_id: &str) -> Result<()> {
        self.lock().defs.remove(def_id);
        Ok(())
    }

    async fn update_status(&self, def_id: &str, status: TimerStatus) -> Result<()> {
        let mut inner = self.lock();
        let def = inner
            .defs
            .get_mut(def_id)
            .ok_or_else(|| BelfryError::TimerNotFound(def_id.to_string()))?;
        def.status = status;
        Ok(())
    }

    async fn get_by_app_and_name(
        &self,
        app: &str,
        name: &str,
    ) -> Result<Option<TimerDefinition>> {
        Ok(self
            .lock()
            .defs
            .values()
            .find(|d| d.app == app && d.name == name)
            .cloned())
    }

    async fn page_query(&self, app: &str, offset: u64, limit: u64) -> Result<Vec<TimerDefinition>> {
        let inner = self.lock();
        let mut defs: Vec<TimerDefinition> = inner
            .defs
            .values()
            .filter(|d| app.is_empty() || d.app == app)
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count(&self, app: &str) -> Result<u64> {
        let inner = self.lock();
        Ok(inner
            .defs
            .values()
            .filter(|d| app.is_empty() || d.app == app)
            .count() as u64)
    }

    async fn count_by_status(&self, status: TimerStatus) -> Result<u64> {
        let inner = self.lock();
        Ok(inner.defs.values().filter(|d| d.status == status).count() as u64)
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn create(&self, row: &RunHistory) -> Result<()> {
        self.lock().history.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn update(&self, row: &RunHistory) -> Result<()> {
        self.lock().history.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.lock().history.remove(id);
        Ok(())
    }

    async fn page_query(&self, def_id: &str, offset: u64, limit: u64) -> Result<Vec<RunHistory>> {
        let inner = self.lock();
        let mut rows: Vec<RunHistory> = inner
            .history
            .values()
            .filter(|r| def_id.is_empty() || r.def_id == def_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count(&self, def_id: &str) -> Result<u64> {
        let inner = self.lock();
        Ok(inner
            .history
            .values()
            .filter(|r| def_id.is_empty() || r.def_id == def_id)
            .count() as u64)
    }

    async fn delete_older_than(&self, cutoff: i64) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.history.len();
        inner.history.retain(|_, r| r.created_at >= cutoff);
        Ok((before - inner.history.len()) as u64)
    }
}
