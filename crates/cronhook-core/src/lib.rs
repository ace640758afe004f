//! `cronhook-core` — configuration, shared error type and the injectable clock.

pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CronhookConfig;
pub use error::{CronhookError, Result};
