//! Redis storage for the belfry timer engine.
//!
//! Implements [`SliceStore`] and [`BucketStore`] on Redis. Key formats are
//! shared with every other process scheduling against the same instance,
//! so they are fixed (see `belfry_core::slice`):
//!
//! - slice claim: `"YYYY-MM-DD HH:MM"` (STRING)
//! - claim mutex: `"LOCK_<slice>"` (STRING, token-holding)
//! - bucket: `"<shard>_<slice>"` (ZSET scored by trigger second)
//! - save task: `"task_<def_id>"` (STRING, JSON)
//! - pending window: `"pending_<from>_<to>"` (SET)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use belfry_redis::RedisStore;
//!
//! #[tokio::main]
//! async fn main() -> belfry_core::Result<()> {
//!     let store = RedisStore::new("redis://localhost", 4).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use belfry_core::{
    bucket_key, evaluate_claim, minute_slice, pending_member, pending_window, slice_lock,
    BelfryError, BucketStore, ClaimDecision, ClaimOutcome, Result, SaveTask, SliceStore,
    CLAIM_LOCK_TTL_MS, PENDING_TTL_SECS, SLICE_TTL_SECS, SUCCESS_SENTINEL,
};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

/// Key of a definition's save task.
pub fn save_task_key(def_id: &str) -> String {
    format!("task_{}", def_id)
}

fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn backend_err(e: redis::RedisError) -> BelfryError {
    BelfryError::Backend(e.to_string())
}

/// A held distributed lock. Dropping the handle without calling
/// [`RedisLock::release`] leaves the key to expire on its own TTL.
#[derive(Debug, Clone)]
pub struct LockHandle {
    key: String,
    token: String,
    /// Explicit re-entry count; the key is deleted when it returns to zero.
    depth: u32,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Re-enter a lock this caller already holds. Callers that pass the
    /// handle down a call chain increment instead of re-acquiring.
    pub fn reenter(&mut self) {
        self.depth += 1;
    }
}

/// Token-based distributed mutex on a single Redis key.
#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
}

impl RedisLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Try to take the lock. `None` means another holder has it.
    pub async fn acquire(&self, key: &str, ttl_ms: u64) -> Result<Option<LockHandle>> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4().to_string();
        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(acquired.then(|| LockHandle {
            key: key.to_string(),
            token,
            depth: 1,
        }))
    }

    /// Release one level of the lock. The key is deleted only if this
    /// handle's token still owns it, so an expired-and-reacquired lock is
    /// never released out from under the new holder.
    pub async fn release(&self, handle: &mut LockHandle) -> Result<()> {
        handle.depth = handle.depth.saturating_sub(1);
        if handle.depth > 0 {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        );
        script
            .key(&handle.key)
            .arg(&handle.token)
            .invoke_async::<i32>(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

/// Redis-backed slice and bucket store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    lock: RedisLock,
    shard_count: u32,
}

impl RedisStore {
    pub async fn new(redis_url: &str, shard_count: u32) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(backend_err)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_err)?;
        Ok(Self::with_connection(conn, shard_count))
    }

    pub fn with_connection(conn: ConnectionManager, shard_count: u32) -> Self {
        Self {
            lock: RedisLock::new(conn.clone()),
            conn,
            shard_count: shard_count.max(1),
        }
    }

    pub fn lock(&self) -> &RedisLock {
        &self.lock
    }
}

#[async_trait]
impl SliceStore for RedisStore {
    /// Claim under the 2-second per-slice mutex: read the stored value,
    /// run the claim state machine, and write the self-timeout if won.
    async fn claim_slice(&self, slice: &str) -> Result<ClaimOutcome> {
        let Some(mut held) = self.lock.acquire(&slice_lock(slice), CLAIM_LOCK_TTL_MS).await? else {
            // Someone else is inside the claim critical section right now.
            return Ok(ClaimOutcome::HeldByPeer);
        };

        let outcome = self.claim_locked(slice).await;
        self.lock.release(&mut held).await?;
        outcome
    }

    /// Mark under the same per-slice mutex as the claim, so the sentinel
    /// write cannot interleave with a peer's timeout-reclaim decision.
    async fn mark_slice_success(&self, slice: &str) -> Result<()> {
        let Some(mut held) = self.lock.acquire(&slice_lock(slice), CLAIM_LOCK_TTL_MS).await? else {
            return Err(BelfryError::Backend(format!(
                "slice mutex busy, success mark deferred: {}",
                slice
            )));
        };

        let outcome = self.mark_locked(slice).await;
        self.lock.release(&mut held).await?;
        outcome
    }
}

impl RedisStore {
    async fn mark_locked(&self, slice: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let existing: Option<String> = conn.get(slice).await.map_err(backend_err)?;
        if existing.as_deref() == Some(SUCCESS_SENTINEL) {
            return Err(BelfryError::SliceCompleted(slice.to_string()));
        }
        conn.set_ex::<_, _, ()>(slice, SUCCESS_SENTINEL, SLICE_TTL_SECS)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn claim_locked(&self, slice: &str) -> Result<ClaimOutcome> {
        let mut conn = self.conn.clone();
        let existing: Option<String> = conn.get(slice).await.map_err(backend_err)?;
        match evaluate_claim(existing.as_deref(), current_timestamp()) {
            ClaimDecision::Write(value) => {
                conn.set_ex::<_, _, ()>(slice, value, SLICE_TTL_SECS)
                    .await
                    .map_err(backend_err)?;
                Ok(ClaimOutcome::Claimed)
            }
            ClaimDecision::AlreadyDone => Ok(ClaimOutcome::AlreadyDone),
            ClaimDecision::HeldByPeer => Ok(ClaimOutcome::HeldByPeer),
        }
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    async fn register(&self, shard: u32, trigger_time: i64, def_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let bucket = bucket_key(shard, &minute_slice(trigger_time));
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        let task = SaveTask {
            bucket_time_id: bucket.clone(),
            trigger_time,
            unix_time_nanos: nanos,
        };
        let task_json = serde_json::to_string(&task)?;
        let window = pending_window(trigger_time);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(&bucket, def_id, trigger_time)
            .expire(&bucket, SLICE_TTL_SECS as i64)
            .set(save_task_key(def_id), task_json)
            .sadd(&window, pending_member(def_id, nanos))
            // Pending windows carry audit data for a week past the trigger.
            .expire_at(&window, trigger_time + PENDING_TTL_SECS);

        pipe.query_async::<()>(&mut conn).await.map_err(backend_err)?;
        Ok(())
    }

    async fn scan_due(&self, bucket: &str, start: i64, end: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.zrangebyscore(bucket, start, end)
            .await
            .map_err(backend_err)
    }

    async fn remove(&self, bucket: &str, def_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(bucket, def_id)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn not_triggered(&self, bucket: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.zrange(bucket, 0, -1).await.map_err(backend_err)
    }

    async fn load_save_task(&self, def_id: &str) -> Result<Option<SaveTask>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(save_task_key(def_id))
            .await
            .map_err(backend_err)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_save_task(&self, def_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(save_task_key(def_id))
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn remove_pending(&self, def_id: &str, unix_nanos: i64, trigger_time: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(
            pending_window(trigger_time),
            pending_member(def_id, unix_nanos),
        )
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn count_pending(&self, now: i64) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.scard(pending_window(now)).await.map_err(backend_err)
    }
}


// ========== Integration Tests (require Redis) ==========

#[cfg(test)]
mod integration_tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn test_slice() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        // Unique per run so tests never race each other's keys.
        format!("9999-01-01 {:02}:{:02}", ts % 24, ts % 60)
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_claim_is_exclusive() {
        let store = RedisStore::new(&redis_url(), 4)
            .await
            .expect("Failed to connect to Redis");
        let slice = test_slice();

        assert_eq!(
            store.claim_slice(&slice).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim_slice(&slice).await.unwrap(),
            ClaimOutcome::HeldByPeer
        );

        store.mark_slice_success(&slice).await.unwrap();
        assert_eq!(
            store.claim_slice(&slice).await.unwrap(),
            ClaimOutcome::AlreadyDone
        );
        assert!(store.mark_slice_success(&slice).await.is_err());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_mark_success_waits_for_slice_mutex() {
        let store = RedisStore::new(&redis_url(), 4)
            .await
            .expect("Failed to connect to Redis");
        let slice = test_slice();

        // A peer inside the claim critical section blocks the mark too.
        let mut held = store
            .lock()
            .acquire(&slice_lock(&slice), 5_000)
            .await
            .unwrap()
            .unwrap();
        assert!(store.mark_slice_success(&slice).await.is_err());

        store.lock().release(&mut held).await.unwrap();
        store.mark_slice_success(&slice).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_register_scan_remove() {
        let store = RedisStore::new(&redis_url(), 4)
            .await
            .expect("Failed to connect to Redis");
        let def_id = format!("it-def-{}", uuid::Uuid::new_v4());
        let trigger = current_timestamp() + 3600;

        store.register(1, trigger, &def_id).await.unwrap();

        let bucket = bucket_key(1, &minute_slice(trigger));
        let due = store.scan_due(&bucket, trigger - 1, trigger + 1).await.unwrap();
        assert!(due.contains(&def_id));

        let task = store.load_save_task(&def_id).await.unwrap().unwrap();
        assert_eq!(task.trigger_time, trigger);
        assert!(store.count_pending(trigger).await.unwrap() >= 1);

        store
            .remove_pending(&def_id, task.unix_time_nanos, trigger)
            .await
            .unwrap();
        store.remove(&bucket, &def_id).await.unwrap();
        store.delete_save_task(&def_id).await.unwrap();
        assert!(store.load_save_task(&def_id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_lock_acquire_and_release() {
        let store = RedisStore::new(&redis_url(), 4)
            .await
            .expect("Failed to connect to Redis");
        let key = format!("LOCK_it-{}", uuid::Uuid::new_v4());

        let mut handle = store.lock().acquire(&key, 5_000).await.unwrap().unwrap();
        assert!(store.lock().acquire(&key, 5_000).await.unwrap().is_none());

        store.lock().release(&mut handle).await.unwrap();
        let mut second = store.lock().acquire(&key, 5_000).await.unwrap().unwrap();
        store.lock().release(&mut second).await.unwrap();
    }
}
