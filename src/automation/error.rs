//! Error types for the channel worker pool.

use thiserror::Error;

/// Errors returned to callers of the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The channel's command queue is at capacity.
    #[error("Command queue for channel {channel} is full (capacity {capacity})")]
    QueueFull { channel: String, capacity: usize },

    /// The operation name is not supported.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// The operation was given the wrong arguments.
    #[error("Invalid arguments for {operation}: {message}")]
    InvalidArguments { operation: String, message: String },

    /// The operation ran and failed.
    #[error("{operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    /// The worker was closed before or while the command ran.
    #[error("Channel worker is closed")]
    Closed,
}

/// Result type for worker pool operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Failures reported by an automation session.
///
/// [`SessionError::Dead`] tells the worker to recreate the session; every
/// other variant is reported to the caller as is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session is gone (browser closed, driver lost it).
    #[error("Session is dead: {0}")]
    Dead(String),

    /// The session is alive but the command failed.
    #[error("{0}")]
    Failed(String),

    /// The command did not finish in time.
    #[error("Timed out")]
    Timeout,
}

/// Result type for session calls.
pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    /// Whether the session has to be replaced.
    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Dead(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_display() {
        let err = WorkerError::QueueFull {
            channel: "42".into(),
            capacity: 1,
        };
        assert_eq!(err.to_string(), "Command queue for channel 42 is full (capacity 1)");
    }

    #[test]
    fn test_session_error_is_dead() {
        assert!(SessionError::Dead("browser closed".into()).is_dead());
        assert!(!SessionError::Failed("no such element".into()).is_dead());
        assert!(!SessionError::Timeout.is_dead());
    }
}
