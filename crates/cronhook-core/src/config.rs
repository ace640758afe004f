use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CronhookError, Result};

pub const DEFAULT_TICK_MS: u64 = 1_000;
pub const DEFAULT_LEASE_MS: u64 = 60_000;
pub const DEFAULT_CALLBACK_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRY_CEILING_MS: u64 = 3_600_000; // 1 h
/// Headroom the lease must leave on top of the callback timeout for store
/// writes and queue hand-off before a run looks abandoned.
pub const LEASE_PROCESSING_MARGIN_MS: u64 = 5_000;

/// Top-level config (cronhook.toml + CRONHOOK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronhookConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Scheduler loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Lease owner id for this process. Generated at startup when unset.
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Lease granted on claim; a run whose lease lapses is reclaimed.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Upper bound on jobs (and, separately, runs) claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Ceiling for the loop's own back-off after store/queue failures.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            tick_ms: default_tick_ms(),
            lease_ms: default_lease_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            batch_size: default_batch_size(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Worker pool and callback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,
    /// Inclusive range of HTTP statuses counted as success.
    #[serde(default = "default_success_min")]
    pub success_status_min: u16,
    #[serde(default = "default_success_max")]
    pub success_status_max: u16,
    /// How many times a post-callback store write is retried before the run
    /// is left for lease recovery.
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            callback_timeout_ms: default_callback_timeout_ms(),
            success_status_min: default_success_min(),
            success_status_max: default_success_max(),
            store_retry_attempts: default_store_retry_attempts(),
        }
    }
}

/// Which back-off curve the worker applies between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicyKind {
    #[default]
    Exponential,
    Linear,
    Fixed,
    Jittered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub policy: RetryPolicyKind,
    #[serde(default = "default_retry_ceiling_ms")]
    pub ceiling_ms: u64,
    /// Fraction of the delay that `jittered` may shave off (0.0–1.0).
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicyKind::default(),
            ceiling_ms: default_retry_ceiling_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// An unacknowledged delivery becomes visible again after this long.
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
    /// Maximum undelivered plus in-flight tasks; enqueue fails beyond it.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: default_visibility_timeout_ms(),
            capacity: default_queue_capacity(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronhook/cronhook.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}
fn default_lease_ms() -> u64 {
    DEFAULT_LEASE_MS
}
fn default_sweep_interval_ms() -> u64 {
    10_000
}
fn default_batch_size() -> u32 {
    100
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_concurrency() -> u32 {
    8
}
fn default_callback_timeout_ms() -> u64 {
    DEFAULT_CALLBACK_TIMEOUT_MS
}
fn default_success_min() -> u16 {
    200
}
fn default_success_max() -> u16 {
    299
}
fn default_store_retry_attempts() -> u32 {
    5
}
fn default_retry_ceiling_ms() -> u64 {
    DEFAULT_RETRY_CEILING_MS
}
fn default_jitter_ratio() -> f64 {
    0.2
}
fn default_visibility_timeout_ms() -> u64 {
    DEFAULT_LEASE_MS
}
fn default_queue_capacity() -> usize {
    10_000
}

impl CronhookConfig {
    /// Load config from a TOML file with CRONHOOK_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. $CRONHOOK_CONFIG
    ///   3. ~/.cronhook/cronhook.toml
    ///
    /// A missing file is not an error; defaults fill every field. Nested keys
    /// are addressed with a double underscore, e.g. `CRONHOOK_WORKER__CONCURRENCY=4`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("CRONHOOK_CONFIG").ok())
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading configuration");

        Self::figment(&path)
            .extract::<CronhookConfig>()
            .map_err(|e| CronhookError::Config(e.to_string()))
            .and_then(|config| {
                config.validate()?;
                Ok(config)
            })
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(CronhookConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("CRONHOOK_").split("__"))
    }

    /// Reject combinations that would break the scheduling guarantees.
    pub fn validate(&self) -> Result<()> {
        let min_lease = self
            .worker
            .callback_timeout_ms
            .saturating_add(LEASE_PROCESSING_MARGIN_MS);
        if self.scheduler.lease_ms <= min_lease {
            return Err(CronhookError::Config(format!(
                "scheduler.lease_ms ({}) must exceed worker.callback_timeout_ms + {} ({})",
                self.scheduler.lease_ms, LEASE_PROCESSING_MARGIN_MS, min_lease
            )));
        }
        if self.worker.success_status_min > self.worker.success_status_max {
            return Err(CronhookError::Config(format!(
                "worker.success_status_min ({}) is above success_status_max ({})",
                self.worker.success_status_min, self.worker.success_status_max
            )));
        }
        if !(100..=599).contains(&self.worker.success_status_min)
            || !(100..=599).contains(&self.worker.success_status_max)
        {
            return Err(CronhookError::Config(
                "worker success status range must lie within 100..=599".to_string(),
            ));
        }
        if self.scheduler.tick_ms == 0 || self.scheduler.sweep_interval_ms == 0 {
            return Err(CronhookError::Config(
                "scheduler.tick_ms and scheduler.sweep_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.queue.capacity == 0 || self.queue.visibility_timeout_ms == 0 {
            return Err(CronhookError::Config(
                "queue.capacity and queue.visibility_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(CronhookError::Config(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(CronhookError::Config(format!(
                "retry.jitter_ratio ({}) must be within 0.0..=1.0",
                self.retry.jitter_ratio
            )));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronhook/cronhook.toml", home)
}
