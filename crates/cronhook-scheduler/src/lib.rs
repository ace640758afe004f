//! `cronhook-scheduler` — durable job store, due-time calculation, and the
//! claim/dispatch loop.
//!
//! # Overview
//!
//! Jobs and their runs live in SQLite ([`store::SqliteJobStore`]). Each
//! [`engine::SchedulerEngine`] polls the store, claims due occurrences with a
//! conditional write, and pushes a [`types::DispatchTask`] onto a
//! [`queue::DispatchQueue`]. Workers (in `cronhook-worker`) drive the run
//! from there.
//!
//! # Run lifecycle
//!
//! | State             | Entered when                                      |
//! |-------------------|---------------------------------------------------|
//! | `claimed`         | a scheduler wins the claim and leases the run     |
//! | `executing`       | a worker starts an attempt                        |
//! | `succeeded`       | the callback answered inside the success range    |
//! | `retry_scheduled` | an attempt failed with budget left                |
//! | `failed_terminal` | an attempt failed with no budget left             |
//! | `pending`         | a lease lapsed; the next tick re-claims the run   |
//!
//! # Schedule variants
//!
//! | Variant | Behaviour                                              |
//! |---------|--------------------------------------------------------|
//! | `Cron`  | Five-field cron expression in an IANA time zone        |
//! | `Once`  | Single fire at an absolute UTC instant                 |

pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod handle;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{SchedulerEngine, TickReport};
pub use error::{Result, SchedulerError};
pub use handle::{JobDefinition, SchedulerHandle};
pub use queue::{Delivery, DispatchQueue, MemoryQueue};
pub use retry::BackoffPolicy;
pub use schedule::next_occurrence;
pub use store::{JobStore, Lease, SqliteJobStore};
pub use types::{CallbackTarget, DispatchTask, Job, Run, RunOutcome, RunState, Schedule};
