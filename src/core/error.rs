//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// All worker permits are currently held by in-flight executions.
    #[error("no available executors")]
    NoAvailableExecutors,
    /// A row in the database references a task name with no registered
    /// implementation. The row is left intact.
    #[error("no registered task with name `{0}`")]
    UnknownTask(String),
    /// Payload encoding or decoding failed.
    #[error("payload serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Database-level failure with context.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The execution store does not implement the requested operation.
    #[error("operation not supported by this execution store: {0}")]
    UnsupportedOperation(&'static str),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The scheduler is shutting down and no longer accepts work.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Handler-facing result using anyhow for task business logic.
pub type AppResult<T> = Result<T, anyhow::Error>;
