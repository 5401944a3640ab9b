//! Error types for tierq.
//!
//! Capacity exhaustion and empty queues are not errors: enqueue reports them
//! with `false` and dequeue with an empty result. The variants here cover
//! configuration mistakes and failures of the code driving the queues.

use thiserror::Error;

use crate::memory::layout::LayoutError;
use crate::types::TaskTypeId;

/// Result type alias for tierq operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The planned shared-memory layout is invalid.
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),

    /// A queue was configured or addressed incorrectly.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A task handler failed.
    #[error("task {task} failed: {message}")]
    Task {
        /// Task type that failed.
        task: TaskTypeId,
        /// Failure description.
        message: String,
    },
}

/// Queue addressing and construction errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// No queue exists for the task type.
    #[error("no queue registered for {0}")]
    UnknownTaskType(TaskTypeId),

    /// The task type was registered twice.
    #[error("{0} registered twice")]
    DuplicateTaskType(TaskTypeId),

    /// A record does not match the record size the queue was planned for.
    #[error("{task} expects {expected} record words, got {found}")]
    RecordSize {
        /// Task type addressed.
        task: TaskTypeId,
        /// Words per record in the plan.
        expected: u32,
        /// Words per record supplied.
        found: u32,
    },

    /// A record index past the end of the batch being read.
    #[error("record {index} is outside a {task} batch of {count}")]
    OutOfBatch {
        /// Task type of the batch.
        task: TaskTypeId,
        /// Index requested.
        index: u32,
        /// Records in the batch.
        count: u32,
    },

    /// Group width outside `1..=64`.
    #[error("group width {0} is outside 1..=64")]
    InvalidGroupWidth(u32),
}
