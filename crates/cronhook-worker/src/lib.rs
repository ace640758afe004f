//! `cronhook-worker` — executes dispatch tasks as outbound HTTP callbacks.
//!
//! A [`Worker`] accepts a delivery only if its claim token still matches the
//! run (`claimed` → `executing`), performs exactly one callback attempt, and
//! records `succeeded`, `retry_scheduled` or `failed_terminal`. Retries are
//! picked up again by the scheduler loop once their back-off elapses.

pub mod error;
pub mod executor;
pub mod worker;

pub use error::{Result, WorkerError};
pub use executor::{CallbackExecutor, CallbackOutcome, HttpExecutor};
pub use worker::{Processed, Worker, WorkerPool};
