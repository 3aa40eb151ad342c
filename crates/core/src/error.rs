//! Error types for the belfry timer engine.

use thiserror::Error;

/// The main error type for the belfry library.
#[derive(Error, Debug)]
pub enum BelfryError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage backend error (Redis, SQL, ...).
    #[error("Backend error: {0}")]
    Backend(String),

    /// Message bus error.
    #[error("Bus error: {0}")]
    Bus(String),

    /// HTTP callback invocation error.
    #[error("Callback error: {0}")]
    Callback(String),

    /// Invalid cron expression or occurrence computation failure.
    #[error("Cron error: {0}")]
    Cron(String),

    /// Rejected at definition-create time (malformed cron, missing URL, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timer definition not found.
    #[error("Timer not found: {0}")]
    TimerNotFound(String),

    /// A slice was already marked successful; the second completion is refused.
    #[error("Slice already completed: {0}")]
    SliceCompleted(String),

    /// The shared worker pool is at capacity; the submission was shed.
    #[error("Worker pool full: {0}")]
    PoolFull(String),
}

/// Result type alias using BelfryError.
pub type Result<T> = std::result::Result<T, BelfryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_backend() {
        let err = BelfryError::Backend("connection refused".to_string());
        assert_eq!(format!("{}", err), "Backend error: connection refused");
    }

    #[test]
    fn test_error_display_validation() {
        let err = BelfryError::Validation("notify url is empty".to_string());
        assert_eq!(format!("{}", err), "Validation error: notify url is empty");
    }

    #[test]
    fn test_error_display_slice_completed() {
        let err = BelfryError::SliceCompleted("2026-08-27 10:41".to_string());
        assert_eq!(
            format!("{}", err),
            "Slice already completed: 2026-08-27 10:41"
        );
    }

    #[test]
    fn test_error_display_timer_not_found() {
        let err = BelfryError::TimerNotFound("def-123".to_string());
        assert_eq!(format!("{}", err), "Timer not found: def-123");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err: BelfryError = json_err.into();
        assert!(matches!(err, BelfryError::Serialization(_)));
    }

    #[test]
    fn test_error_debug() {
        let err = BelfryError::Bus("publish failed".to_string());
        let debug = format!("{:?}", err);
        assert!(debug.contains("Bus"));
        assert!(debug.contains("publish failed"));
    }
}
