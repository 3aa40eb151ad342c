//! Callback traffic limiter.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{BelfryError, Result};

/// Gates callback invocation rate across the notify stage. Permits are
/// released on drop.
#[derive(Clone)]
pub struct TrafficLimiter {
    permits: Arc<Semaphore>,
}

impl TrafficLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Wait for a slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BelfryError::Config("traffic limiter closed".to_string()))
    }

    /// Take a slot without waiting, or `None` at capacity.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
