use std::sync::Arc;

use chrono::{DateTime, Utc};
use cronhook_core::Clock;
use http::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, SchedulerError},
    schedule::{next_occurrence, validate_schedule},
    store::JobStore,
    types::{CallbackTarget, Job, Run, Schedule, DEFAULT_TIMEZONE},
};

/// Compare-and-swap retries for a definition edit racing the scheduler.
const MAX_EDIT_ATTEMPTS: u32 = 5;

const ALLOWED_METHODS: [&str; 6] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;

/// User-facing job definition. Exactly one of `cron` and `run_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    /// IANA zone for `cron`; UTC when absent.
    #[serde(default)]
    pub timezone: Option<String>,
    pub callback: CallbackTarget,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}
fn default_enabled() -> bool {
    true
}

impl JobDefinition {
    pub fn cron(name: impl Into<String>, expression: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cron: Some(expression.into()),
            run_at: None,
            timezone: None,
            callback: CallbackTarget::post(url),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            enabled: true,
        }
    }

    pub fn once(name: impl Into<String>, at: DateTime<Utc>, url: impl Into<String>) -> Self {
        Self {
            cron: None,
            run_at: Some(at),
            ..Self::cron(name, String::new(), url)
        }
    }

    /// Validate the definition and derive its schedule.
    pub fn schedule(&self) -> Result<Schedule> {
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        let schedule = match (&self.cron, self.run_at) {
            (Some(expression), None) => Schedule::Cron {
                expression: expression.trim().to_string(),
                timezone: self
                    .timezone
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            },
            (None, Some(at)) => {
                if self.timezone.is_some() {
                    return Err(invalid("timezone applies to cron schedules only"));
                }
                Schedule::Once { at }
            }
            (Some(_), Some(_)) => return Err(invalid("set either cron or run_at, not both")),
            (None, None) => return Err(invalid("one of cron or run_at is required")),
        };
        validate_schedule(&schedule)?;
        validate_callback(&self.callback)?;
        Ok(schedule)
    }
}

fn validate_callback(callback: &CallbackTarget) -> Result<()> {
    let url = callback.url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| invalid(format!("callback url must be http(s): {url}")))?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(invalid(format!("callback url has no host: {url}")));
    }
    if !ALLOWED_METHODS.contains(&callback.method.as_str()) {
        return Err(invalid(format!(
            "unsupported callback method: {}",
            callback.method
        )));
    }
    for (name, value) in &callback.headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| invalid(format!("invalid callback header name: {name:?}")))?;
        HeaderValue::from_str(value)
            .map_err(|_| invalid(format!("invalid value for callback header {name}")))?;
    }
    Ok(())
}

/// First due time of a new or replaced schedule. A one-shot must lie ahead.
fn first_due(schedule: &Schedule, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let next = next_occurrence(schedule, now)?;
    if matches!(schedule, Schedule::Once { .. }) && next.is_none() {
        return Err(invalid("run_at is not in the future"));
    }
    Ok(next)
}

fn invalid(msg: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidDefinition(msg.into())
}

/// Job management (create/update/delete/enable/disable) while engines run.
///
/// Every edit goes through the store's versioned update, so an edit that
/// races a scheduler claim is re-read and re-applied instead of overwriting
/// the claim's advance of `next_run_at`.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl SchedulerHandle {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn create(&self, definition: &JobDefinition) -> Result<Job> {
        let schedule = definition.schedule()?;
        let now = self.clock.now();
        let next_run_at = first_due(&schedule, now)?;

        let job = Job {
            id: Uuid::now_v7().to_string(),
            name: definition.name.trim().to_string(),
            schedule,
            callback: definition.callback.clone(),
            max_retries: definition.max_retries,
            retry_backoff_ms: definition.retry_backoff_ms,
            enabled: definition.enabled,
            next_run_at,
            last_run_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_job(&job)?;
        info!(job_id = %job.id, name = %job.name, next_run_at = ?job.next_run_at, "job created");
        Ok(job)
    }

    /// Replace a job's definition. The next due time is recomputed from now.
    pub fn update(&self, key: &str, definition: &JobDefinition) -> Result<Job> {
        let schedule = definition.schedule()?;
        let job = self.edit(key, |job, now| {
            job.name = definition.name.trim().to_string();
            job.schedule = schedule.clone();
            job.callback = definition.callback.clone();
            job.max_retries = definition.max_retries;
            job.retry_backoff_ms = definition.retry_backoff_ms;
            job.enabled = definition.enabled;
            job.next_run_at = first_due(&job.schedule, now)?;
            Ok(())
        })?;
        info!(job_id = %job.id, "job updated");
        Ok(job)
    }

    /// Delete a job. A run already claimed still finishes from its snapshot.
    pub fn delete(&self, key: &str) -> Result<()> {
        let job = self.resolve(key)?;
        self.store.delete_job(&job.id)?;
        info!(job_id = %job.id, name = %job.name, "job deleted");
        Ok(())
    }

    /// Enable a job. Occurrences missed while disabled are skipped: the next
    /// due time is computed from now.
    pub fn enable(&self, key: &str) -> Result<Job> {
        let job = self.edit(key, |job, now| {
            job.enabled = true;
            job.next_run_at = next_occurrence(&job.schedule, now)?;
            Ok(())
        })?;
        if job.next_run_at.is_none() {
            warn!(job_id = %job.id, "enabled job has no future occurrence");
        }
        info!(job_id = %job.id, next_run_at = ?job.next_run_at, "job enabled");
        Ok(job)
    }

    /// Disable a job. In-flight and retrying runs are left to finish.
    pub fn disable(&self, key: &str) -> Result<Job> {
        let job = self.edit(key, |job, _| {
            job.enabled = false;
            Ok(())
        })?;
        info!(job_id = %job.id, "job disabled");
        Ok(job)
    }

    pub fn get(&self, key: &str) -> Result<Job> {
        self.resolve(key)
    }

    pub fn list(&self) -> Result<Vec<Job>> {
        self.store.list_jobs()
    }

    /// Per-occurrence history, newest first.
    pub fn history(&self, key: &str, limit: u32) -> Result<Vec<Run>> {
        let job_id = match self.resolve(key) {
            Ok(job) => job.id,
            // History outlives the job row; accept a raw id.
            Err(SchedulerError::JobNotFound { .. }) => key.to_string(),
            Err(e) => return Err(e),
        };
        self.store.runs_for_job(&job_id, limit)
    }

    pub fn run(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| SchedulerError::RunNotFound {
                id: run_id.to_string(),
            })
    }

    /// Look a job up by id, then by name.
    fn resolve(&self, key: &str) -> Result<Job> {
        if let Some(job) = self.store.get_job(key)? {
            return Ok(job);
        }
        self.store
            .find_job_by_name(key)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: key.to_string() })
    }

    fn edit<F>(&self, key: &str, apply: F) -> Result<Job>
    where
        F: Fn(&mut Job, DateTime<Utc>) -> Result<()>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut job = self.resolve(key)?;
            let now = self.clock.now();
            apply(&mut job, now)?;
            job.updated_at = now;
            match self.store.update_job(&job) {
                Err(SchedulerError::VersionConflict { .. }) if attempt < MAX_EDIT_ATTEMPTS => {
                    continue
                }
                other => return other,
            }
        }
    }
}
