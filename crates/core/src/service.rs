//! Application-facing timer operations.
//!
//! Everything the HTTP layer (or an embedding process) does to timers goes
//! through [`TimerService`]: definition CRUD, activation, manual triggering
//! and the audit queries. The pipeline stages never mutate definitions;
//! this service and the notify stage are the only writers.

use std::sync::Arc;
use std::time::Duration;

use crate::callback::CallbackInvoker;
use crate::error::{BelfryError, Result};
use crate::slice::{parse_bucket_key, shard_for, slice_start};
use crate::store::{DynBucketStore, DynDefinitionStore, DynHistoryStore};
use crate::timer::{RunHistory, RunStatus, TimerDefinition, TimerStatus};

fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub struct TimerService {
    defs: DynDefinitionStore,
    buckets: DynBucketStore,
    history: DynHistoryStore,
    invoker: Arc<dyn CallbackInvoker>,
}

impl TimerService {
    pub fn new(
        defs: DynDefinitionStore,
        buckets: DynBucketStore,
        history: DynHistoryStore,
        invoker: Arc<dyn CallbackInvoker>,
    ) -> Self {
        Self {
            defs,
            buckets,
            history,
            invoker,
        }
    }

    /// Create a definition. Names are unique within an app; definitions
    /// start Disabled and fire nothing until enabled.
    pub async fn create_definition(&self, def: &TimerDefinition) -> Result<()> {
        def.validate()?;
        if self
            .defs
            .get_by_app_and_name(&def.app, &def.name)
            .await?
            .is_some()
        {
            return Err(BelfryError::Validation(format!(
                "timer '{}' already exists in app '{}'",
                def.name, def.app
            )));
        }
        self.defs.create(def).await?;
        tracing::info!(def_id = %def.def_id, app = %def.app, name = %def.name, "Created timer");
        Ok(())
    }

    pub async fn get_definition(&self, def_id: &str) -> Result<TimerDefinition> {
        self.defs
            .get(def_id)
            .await?
            .ok_or_else(|| BelfryError::TimerNotFound(def_id.to_string()))
    }

    pub async fn page_definitions(
        &self,
        app: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<TimerDefinition>, u64)> {
        let rows = self.defs.page_query(app, offset, limit).await?;
        let total = self.defs.count(app).await?;
        Ok((rows, total))
    }

    pub async fn page_history(
        &self,
        def_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<RunHistory>, u64)> {
        let rows = self.history.page_query(def_id, offset, limit).await?;
        let total = self.history.count(def_id).await?;
        Ok((rows, total))
    }

    /// Enable or disable a definition. Enabling registers the first
    /// upcoming occurrence; disabling withdraws any scheduled one.
    pub async fn change_status(&self, def_id: &str, status: TimerStatus) -> Result<()> {
        let def = self.get_definition(def_id).await?;
        if def.status == status {
            return Ok(());
        }
        match status {
            TimerStatus::Enabled => {
                let now = current_timestamp();
                let next = def.next_occurrence(now)?.ok_or_else(|| {
                    BelfryError::Validation(format!(
                        "timer '{}' has no upcoming occurrence",
                        def.name
                    ))
                })?;
                self.defs.update_status(def_id, status).await?;
                self.register_occurrence(def_id, next).await?;
                tracing::info!(def_id = %def_id, "Enabled timer");
            }
            TimerStatus::Disabled => {
                self.defs.update_status(def_id, status).await?;
                self.withdraw(def_id).await?;
                tracing::info!(def_id = %def_id, "Disabled timer");
            }
        }
        Ok(())
    }

    /// Delete a definition and withdraw its scheduling state.
    pub async fn delete_definition(&self, def_id: &str) -> Result<()> {
        // Existence check first so deletes of unknown IDs surface as such.
        self.get_definition(def_id).await?;
        self.withdraw(def_id).await?;
        self.defs.delete(def_id).await?;
        tracing::info!(def_id = %def_id, "Deleted timer");
        Ok(())
    }

    /// Register one occurrence into its shard bucket.
    pub async fn register_occurrence(&self, def_id: &str, trigger_time: i64) -> Result<()> {
        let shard = shard_for(def_id, self.buckets.shard_count());
        self.buckets.register(shard, trigger_time, def_id).await
    }

    /// Drop the save task, bucket entry and pending mark left by the most
    /// recent registration, if any.
    async fn withdraw(&self, def_id: &str) -> Result<()> {
        let Some(task) = self.buckets.load_save_task(def_id).await? else {
            return Ok(());
        };
        self.buckets.remove(&task.bucket_time_id, def_id).await?;
        self.buckets
            .remove_pending(def_id, task.unix_time_nanos, task.trigger_time)
            .await?;
        self.buckets.delete_save_task(def_id).await
    }

    /// Not-yet-dispatched definition IDs in a bucket from `start_time` to
    /// the end of the bucket's minute. Recovery/audit surface.
    pub async fn get_ready_timers(&self, bucket: &str, start_time: i64) -> Result<Vec<String>> {
        let (_, slice) = parse_bucket_key(bucket)?;
        let end = slice_start(&slice)? + 59;
        self.buckets.scan_due(bucket, start_time, end).await
    }

    /// Pending marks in the 10-minute window containing `now`.
    pub async fn count_pending_timers(&self, now: i64) -> Result<usize> {
        self.buckets.count_pending(now).await
    }

    pub async fn count_enabled_timers(&self) -> Result<u64> {
        self.defs.count_by_status(TimerStatus::Enabled).await
    }

    /// Fire a definition's callback immediately, skipping eligibility
    /// checks and re-registration. The attempt is still recorded.
    pub async fn manual_trigger(&self, def_id: &str) -> Result<String> {
        let def = self.get_definition(def_id).await?;
        let now = current_timestamp();
        let mut row = RunHistory::new(&def.def_id, &def.name, now);
        self.history.create(&row).await?;

        let deadline = Duration::from_secs(def.effective_time_limit());
        let started = tokio::time::Instant::now();
        let outcome = self.invoker.call(&def.notify_http_param, deadline).await;
        row.cost_time_ms = started.elapsed().as_millis() as i64;

        let result = match outcome {
            Ok(body) => {
                row.status = RunStatus::Succeed;
                row.output = body.clone();
                Ok(body)
            }
            Err(e) => {
                row.status = if e.timed_out {
                    RunStatus::Timeout
                } else {
                    RunStatus::Failed
                };
                row.output = e.message.clone();
                Err(BelfryError::Callback(e.message))
            }
        };
        self.history.update(&row).await?;
        result
    }
}
