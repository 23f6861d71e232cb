//! Scheduler error types.

use chomflow_core::CoreError;
use thiserror::Error;

/// Errors raised while parsing a cadence.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid interval '{cadence}': {reason}")]
    InvalidInterval { cadence: String, reason: String },

    #[error("interval must be positive: {cadence}")]
    ZeroInterval { cadence: String },
}

impl ScheduleError {
    /// Returns the cadence that failed to parse.
    pub fn cadence(&self) -> &str {
        match self {
            ScheduleError::InvalidCron { expr, .. } => expr,
            ScheduleError::InvalidInterval { cadence, .. } => cadence,
            ScheduleError::ZeroInterval { cadence } => cadence,
        }
    }
}

impl From<ScheduleError> for CoreError {
    fn from(e: ScheduleError) -> Self {
        CoreError::InvalidCadence {
            cadence: e.cadence().to_string(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chomflow_core::ErrorKind;

    #[test]
    fn test_into_core_error() {
        let err: CoreError = ScheduleError::ZeroInterval {
            cadence: "0s".to_string(),
        }
        .into();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.error_code(), "BAD_CADENCE");
        match err {
            CoreError::InvalidCadence { cadence, reason } => {
                assert_eq!(cadence, "0s");
                assert_eq!(reason, "interval must be positive: 0s");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
