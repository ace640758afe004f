use cronhook_scheduler::SchedulerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// The callback body template or method could not be rendered.
    #[error("Template error: {0}")]
    Template(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
