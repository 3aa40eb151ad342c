//! Shared bounded worker pool.
//!
//! All three stages (and the monitor) submit side work here so a consumer
//! callback never blocks on a single message's processing. Submission is
//! non-blocking: at capacity the submission is shed with an error the
//! caller logs, rather than queueing unbounded.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};

use crate::error::{BelfryError, Result};

/// Bounded fire-and-forget task pool shared across stages.
#[derive(Clone)]
pub struct TaskPool {
    capacity: usize,
    slots: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    drain_notify: Arc<Notify>,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Submit a task, or shed it if the pool is at capacity.
    pub fn try_spawn<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| BelfryError::PoolFull(format!("capacity {}", self.capacity)))?;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let drain_notify = self.drain_notify.clone();

        tokio::spawn(async move {
            task.await;
            drop(permit);
            in_flight.fetch_sub(1, Ordering::SeqCst);
            drain_notify.notify_waiters();
        });

        Ok(())
    }

    /// Wait for in-flight tasks to finish, up to `deadline`. Returns the
    /// number still in flight when it gave up (0 on a clean drain).
    pub async fn drain(&self, deadline: Duration) -> usize {
        let until = tokio::time::Instant::now() + deadline;

        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= until {
                break;
            }
            tokio::select! {
                _ = self.drain_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_spawn_runs_task() {
        let pool = TaskPool::new(4);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        pool.try_spawn(async move {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(pool.drain(Duration::from_secs(1)).await, 0);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sheds_at_capacity() {
        let pool = TaskPool::new(1);
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        pool.try_spawn(async move {
            gate.notified().await;
        })
        .unwrap();

        // Give the spawned task a chance to start.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = pool.try_spawn(async {}).unwrap_err();
        assert!(matches!(err, BelfryError::PoolFull(_)));

        release.notify_waiters();
        assert_eq!(pool.drain(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn test_drain_reports_stuck_tasks() {
        let pool = TaskPool::new(1);
        pool.try_spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.drain(Duration::from_millis(50)).await, 1);
    }
}
