//! Error types for the reliable task queue

use thiserror::Error;

/// Result type alias for task operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Error types for the task queue system.
///
/// Unknown or already-resolved task ids are not errors: the lifecycle
/// operations report them as `Ok(false)`.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Redis connection or operation errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Task record serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task handler failures reported by workers
    #[error("Task execution failed: {message}")]
    TaskExecution { message: String },

    /// Store operation errors
    #[error("Queue operation failed: {operation}: {reason}")]
    QueueOperation { operation: String, reason: String },

    /// Worker errors
    #[error("Worker error: {message}")]
    Worker { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Generic errors for wrapping other error types
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    /// Create a task execution error
    pub fn task_execution<S: Into<String>>(message: S) -> Self {
        Self::TaskExecution {
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation<O: Into<String>, R: Into<String>>(operation: O, reason: R) -> Self {
        Self::QueueOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a worker error
    pub fn worker<S: Into<String>>(message: S) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if the error is recoverable (the task may succeed on redelivery)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskError::Redis(_) => true,
            TaskError::Timeout { .. } => true,
            TaskError::QueueOperation { .. } => true,
            TaskError::Worker { .. } => true,
            TaskError::TaskExecution { .. } => true,
            TaskError::Serialization(_) => false,
            TaskError::Config { .. } => false,
            TaskError::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_payloads_are_not_recoverable() {
        let err: TaskError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(!err.is_recoverable());
        assert!(TaskError::task_execution("boom").is_recoverable());
        assert!(TaskError::timeout("handle").is_recoverable());
        assert!(!TaskError::config("bad").is_recoverable());
    }

    #[test]
    fn wrapped_errors_keep_their_message() {
        let err: TaskError = anyhow::anyhow!("disk full").into();
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "Internal error: disk full");

        let err: TaskError =
            redis::RedisError::from((redis::ErrorKind::IoError, "connection reset")).into();
        assert!(err.is_recoverable());
        assert!(err.to_string().starts_with("Redis error:"));

        let err = TaskError::worker("worker loop aborted");
        assert!(err.is_recoverable());
    }

    #[test]
    fn queue_operation_message_names_operation() {
        let err = TaskError::queue_operation("get_task", "connection refused");
        assert_eq!(
            err.to_string(),
            "Queue operation failed: get_task: connection refused"
        );
    }
}
