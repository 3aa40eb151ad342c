//! Timer definitions and related types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cron::CronSchedule;
use crate::error::{BelfryError, Result};

/// Timestamp string format used by `delay_time`, `end_time` and `run_timer`.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Hard cap (and default) for the callback deadline, in seconds.
pub const MAX_EXECUTE_TIME_LIMIT: u64 = 15;

/// Whether a definition is eligible for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerStatus {
    Disabled,
    Enabled,
}

impl TimerStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            TimerStatus::Disabled => 0,
            TimerStatus::Enabled => 1,
        }
    }

    pub fn from_i64(v: i64) -> Result<Self> {
        match v {
            0 => Ok(TimerStatus::Disabled),
            1 => Ok(TimerStatus::Enabled),
            _ => Err(BelfryError::Validation(format!("invalid status {}", v))),
        }
    }
}

/// How the trigger time is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerType {
    /// One absolute trigger time; never repeats.
    Delay,
    /// Cron expression; re-registers after each fire.
    Cron,
}

/// Whether the definition fires once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerType {
    Once,
    Many,
}

/// Whether the definition is deleted automatically after a one-shot fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteType {
    NotDelete,
    TriggerDelete,
}

/// HTTP callback parameters for a definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyHttpParam {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub header: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// A registered timer definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerDefinition {
    /// Stable identity for the definition's lifetime.
    pub def_id: String,
    /// Owning application.
    pub app: String,
    /// Name, unique within the app.
    pub name: String,
    pub creator: String,
    pub status: TimerStatus,
    pub timer_type: TimerType,
    /// 7-field cron expression; only meaningful for `TimerType::Cron`.
    #[serde(default)]
    pub cron: String,
    /// Absolute trigger timestamp string; only meaningful for `TimerType::Delay`.
    #[serde(default)]
    pub delay_time: String,
    pub trigger_type: TriggerType,
    pub delete_type: DeleteType,
    /// Empty means no end time.
    #[serde(default)]
    pub end_time: String,
    pub notify_http_param: NotifyHttpParam,
    /// Callback deadline in seconds, 0..=15; 0 means the default.
    #[serde(default)]
    pub execute_time_limit: u64,
}

impl TimerDefinition {
    /// Create a new definition. Definitions start Disabled; activation
    /// registers the first occurrence.
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            def_id: Uuid::new_v4().to_string(),
            app: app.into(),
            name: name.into(),
            creator: String::new(),
            status: TimerStatus::Disabled,
            timer_type: TimerType::Cron,
            cron: String::new(),
            delay_time: String::new(),
            trigger_type: TriggerType::Many,
            delete_type: DeleteType::NotDelete,
            end_time: String::new(),
            notify_http_param: NotifyHttpParam::default(),
            execute_time_limit: 0,
        }
    }

    /// Validate a definition at create time. Scheduling-layer errors are
    /// invisible to callers, so everything checkable is rejected here.
    pub fn validate(&self) -> Result<()> {
        if self.app.is_empty() {
            return Err(BelfryError::Validation("app is empty".to_string()));
        }
        if self.name.is_empty() {
            return Err(BelfryError::Validation("name is empty".to_string()));
        }
        if self.notify_http_param.url.is_empty() {
            return Err(BelfryError::Validation("notify url is empty".to_string()));
        }
        if self.execute_time_limit > MAX_EXECUTE_TIME_LIMIT {
            return Err(BelfryError::Validation(format!(
                "execute_time_limit {} exceeds maximum {}",
                self.execute_time_limit, MAX_EXECUTE_TIME_LIMIT
            )));
        }
        match self.timer_type {
            TimerType::Delay => {
                // Delay timers always fire exactly once.
                if self.trigger_type != TriggerType::Once {
                    return Err(BelfryError::Validation(
                        "delay timers must have trigger_type Once".to_string(),
                    ));
                }
                parse_time(&self.delay_time)?;
            }
            TimerType::Cron => {
                CronSchedule::parse(&self.cron)?;
            }
        }
        if !self.end_time.is_empty() {
            parse_time(&self.end_time)?;
        }
        Ok(())
    }

    /// Effective callback deadline in seconds.
    pub fn effective_time_limit(&self) -> u64 {
        if self.execute_time_limit == 0 {
            MAX_EXECUTE_TIME_LIMIT
        } else {
            self.execute_time_limit
        }
    }

    /// Whether the definition may fire at `now`: Enabled, and the end time
    /// (when set) has not been reached.
    pub fn eligible_at(&self, now: i64) -> bool {
        if self.status != TimerStatus::Enabled {
            return false;
        }
        if self.end_time.is_empty() {
            return true;
        }
        match parse_time(&self.end_time) {
            Ok(end) => now < end,
            Err(_) => false,
        }
    }

    /// First occurrence strictly after `now`, or `None` when the definition
    /// has none (exhausted cron, delay time in the past).
    pub fn next_occurrence(&self, now: i64) -> Result<Option<i64>> {
        match self.timer_type {
            TimerType::Delay => {
                let at = parse_time(&self.delay_time)?;
                Ok(if at > now { Some(at) } else { None })
            }
            TimerType::Cron => Ok(CronSchedule::parse(&self.cron)?.next_after(now)),
        }
    }
}

/// Parse a `"YYYY-MM-DD HH:MM:SS"` string to a Unix timestamp.
pub fn parse_time(value: &str) -> Result<i64> {
    let naive = chrono::NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .map_err(|e| BelfryError::Validation(format!("invalid time '{}': {}", value, e)))?;
    Ok(naive.and_utc().timestamp())
}

/// Format a Unix timestamp as a `"YYYY-MM-DD HH:MM:SS"` string.
pub fn format_time(unix_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(unix_secs, 0)
        .unwrap_or_default()
        .format(TIME_FORMAT)
        .to_string()
}

/// The most recently scheduled next-fire metadata for a definition.
///
/// Overwritten on each registration; deleted once the fire completes or the
/// definition is disabled or deleted. Correlates dispatch latency and points
/// the cleanup path at the pending mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveTask {
    /// Bucket key the occurrence was registered into.
    pub bucket_time_id: String,
    /// Scheduled trigger time, Unix seconds.
    pub trigger_time: i64,
    /// Registration instant in nanoseconds; part of the pending-mark member.
    pub unix_time_nanos: i64,
}

/// Outcome of a fire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Succeed,
    Failed,
    Timeout,
}

impl RunStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            RunStatus::Running => 0,
            RunStatus::Succeed => 1,
            RunStatus::Failed => 2,
            RunStatus::Timeout => 3,
        }
    }

    pub fn from_i64(v: i64) -> Result<Self> {
        match v {
            0 => Ok(RunStatus::Running),
            1 => Ok(RunStatus::Succeed),
            2 => Ok(RunStatus::Failed),
            3 => Ok(RunStatus::Timeout),
            _ => Err(BelfryError::Validation(format!("invalid run status {}", v))),
        }
    }
}

/// Append-only record of one fire attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistory {
    pub id: String,
    pub def_id: String,
    pub name: String,
    /// Fire wall-clock time as a formatted string.
    pub run_timer: String,
    /// Callback response body or error message.
    pub output: String,
    pub cost_time_ms: i64,
    pub status: RunStatus,
    /// Row creation time, Unix seconds; drives retention.
    pub created_at: i64,
}

impl RunHistory {
    pub fn new(def_id: &str, name: &str, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            def_id: def_id.to_string(),
            name: name.to_string(),
            run_timer: format_time(now),
            output: String::new(),
            cost_time_ms: 0,
            status: RunStatus::Running,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_cron_def() -> TimerDefinition {
        let mut def = TimerDefinition::new("billing", "invoice-sync");
        def.cron = "0 */1 * * * ? *".to_string();
        def.notify_http_param.url = "http://example.com/hook".to_string();
        def.notify_http_param.method = "POST".to_string();
        def
    }

    #[test]
    fn test_validate_ok() {
        valid_cron_def().validate().unwrap();
    }

    #[test]
    fn test_validate_missing_url() {
        let mut def = valid_cron_def();
        def.notify_http_param.url.clear();
        assert!(matches!(
            def.validate(),
            Err(BelfryError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_malformed_cron() {
        let mut def = valid_cron_def();
        def.cron = "not a cron".to_string();
        assert!(matches!(def.validate(), Err(BelfryError::Cron(_))));
    }

    #[test]
    fn test_validate_delay_requires_once() {
        let mut def = valid_cron_def();
        def.timer_type = TimerType::Delay;
        def.delay_time = "2030-01-01 00:00:05".to_string();
        def.trigger_type = TriggerType::Many;
        assert!(def.validate().is_err());
        def.trigger_type = TriggerType::Once;
        def.validate().unwrap();
    }

    #[test]
    fn test_validate_execute_time_limit_cap() {
        let mut def = valid_cron_def();
        def.execute_time_limit = 16;
        assert!(def.validate().is_err());
        def.execute_time_limit = 15;
        def.validate().unwrap();
    }

    #[test]
    fn test_validate_bad_end_time() {
        let mut def = valid_cron_def();
        def.end_time = "tomorrow".to_string();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_effective_time_limit_default() {
        let mut def = valid_cron_def();
        assert_eq!(def.effective_time_limit(), 15);
        def.execute_time_limit = 5;
        assert_eq!(def.effective_time_limit(), 5);
    }

    #[test]
    fn test_eligible_at() {
        let mut def = valid_cron_def();
        let now = parse_time("2026-08-27 10:00:00").unwrap();
        assert!(!def.eligible_at(now)); // created Disabled
        def.status = TimerStatus::Enabled;
        assert!(def.eligible_at(now));
        def.end_time = "2026-08-27 09:00:00".to_string();
        assert!(!def.eligible_at(now));
        def.end_time = "2026-08-27 11:00:00".to_string();
        assert!(def.eligible_at(now));
    }

    #[test]
    fn test_next_occurrence_cron() {
        let def = valid_cron_def();
        let base = 1_700_000_040;
        assert_eq!(def.next_occurrence(base).unwrap(), Some(base + 60));
    }

    #[test]
    fn test_next_occurrence_delay() {
        let mut def = valid_cron_def();
        def.timer_type = TimerType::Delay;
        def.trigger_type = TriggerType::Once;
        def.delay_time = "2030-01-01 00:00:05".to_string();
        let at = parse_time(&def.delay_time).unwrap();
        assert_eq!(def.next_occurrence(at - 10).unwrap(), Some(at));
        // Past delay times have no next occurrence.
        assert_eq!(def.next_occurrence(at + 1).unwrap(), None);
    }

    #[test]
    fn test_time_round_trip() {
        let ts = parse_time("2026-08-27 10:41:05").unwrap();
        assert_eq!(format_time(ts), "2026-08-27 10:41:05");
    }

    #[test]
    fn test_definition_serialization() {
        let def = valid_cron_def();
        let json = serde_json::to_string(&def).unwrap();
        let back: TimerDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.def_id, def.def_id);
        assert_eq!(back.cron, def.cron);
    }

    #[test]
    fn test_run_history_new() {
        let now = parse_time("2026-08-27 10:41:05").unwrap();
        let row = RunHistory::new("def-1", "invoice-sync", now);
        assert_eq!(row.status, RunStatus::Running);
        assert_eq!(row.run_timer, "2026-08-27 10:41:05");
        assert_eq!(row.created_at, now);
    }

    #[test]
    fn test_status_int_mapping() {
        for s in [TimerStatus::Disabled, TimerStatus::Enabled] {
            assert_eq!(TimerStatus::from_i64(s.as_i64()).unwrap(), s);
        }
        for s in [
            RunStatus::Running,
            RunStatus::Succeed,
            RunStatus::Failed,
            RunStatus::Timeout,
        ] {
            assert_eq!(RunStatus::from_i64(s.as_i64()).unwrap(), s);
        }
        assert!(TimerStatus::from_i64(9).is_err());
    }
}
