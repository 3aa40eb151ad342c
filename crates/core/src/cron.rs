//! Cron schedule wrapper.
//!
//! Definitions use 7-field expressions (`sec min hour dom month dow year`),
//! parsed by the `cron` crate.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{BelfryError, Result};

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
    expression: String,
}

impl CronSchedule {
    /// Parse a 7-field cron expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            BelfryError::Cron(format!("invalid cron expression '{}': {}", expression, e))
        })?;
        Ok(Self {
            schedule,
            expression: expression.to_string(),
        })
    }

    /// The original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next occurrence strictly after the given Unix timestamp (seconds).
    ///
    /// Returns `None` when the schedule has no further occurrences. A
    /// non-positive occurrence is rejected as a library edge case rather
    /// than registered into a bucket in the distant past.
    pub fn next_after(&self, unix_secs: i64) -> Option<i64> {
        let after = DateTime::<Utc>::from_timestamp(unix_secs, 0)?;
        let next = self.schedule.after(&after).next()?;
        let ts = next.timestamp();
        if ts <= 0 {
            tracing::error!(
                expression = %self.expression,
                occurrence = ts,
                "Computed cron occurrence has invalid timestamp, refusing to register"
            );
            return None;
        }
        Some(ts)
    }
}
