use thiserror::Error;

use crate::types::RunState;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A job definition failed validation before reaching the store.
    #[error("Invalid job definition: {0}")]
    InvalidDefinition(String),

    /// A run state change that the state machine does not allow.
    #[error("Invalid run transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    /// No job with the given ID or name exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// No run with the given ID exists in the store.
    #[error("Run not found: {id}")]
    RunNotFound { id: String },

    /// The job row changed between read and write (compare-and-swap miss).
    #[error("Job changed concurrently: {id}")]
    VersionConflict { id: String },

    /// A job with the same unique name already exists.
    #[error("Job already exists: {name}")]
    DuplicateJob { name: String },

    /// The dispatch queue rejected or lost an operation.
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A shared lock was poisoned by a panicking holder.
    #[error("Lock poisoned: {0}")]
    Poisoned(String),
}

impl SchedulerError {
    /// True for failures of the store or queue themselves, as opposed to bad
    /// input. Loops back off and retry these.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_) | SchedulerError::Queue(_) | SchedulerError::Poisoned(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
