//! Error types for the evidence-upload library.

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Errors returned by session operations.
///
/// Transfer failures are not reported through this type: they become
/// [`TaskStatus::Failed`] tasks carrying a [`TaskError`](crate::TaskError).
#[derive(Error, Debug)]
pub enum Error {
    /// The caller's file-count cap would be exceeded by this enqueue.
    #[error("file limit exceeded: {requested} requested, {remaining} slots remaining")]
    CapacityExceeded {
        /// Number of files the caller tried to enqueue.
        requested: usize,
        /// Number of files the session can still accept.
        remaining: usize,
    },

    /// Retry was requested for a task that is not a retryable failure.
    #[error("task {id} is not retryable (status: {status})")]
    NotRetryable {
        /// The task that was targeted.
        id: TaskId,
        /// Its status at the time of the request.
        status: TaskStatus,
    },

    /// No task with this id is known to the session.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// A task id was registered twice.
    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// A status change outside the task state machine was attempted.
    #[error("invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        /// The task that was targeted.
        id: TaskId,
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// The session event loop has shut down.
    #[error("upload session is closed")]
    SessionClosed,

    /// I/O error while reading local files or configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration values are out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// A specialized `Result` type for evidence-upload operations.
pub type Result<T> = std::result::Result<T, Error>;
