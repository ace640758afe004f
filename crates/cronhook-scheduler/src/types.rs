use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Defines when a job fires. Exactly one kind per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Standard five-field cron expression evaluated in `timezone`.
    Cron {
        expression: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },

    /// Run exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },
}

impl Schedule {
    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Cron {
            expression: expression.into(),
            timezone: default_timezone(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Schedule::Cron { .. })
    }
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

/// Where and how the worker delivers a job's callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackTarget {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Request body with `{{placeholder}}` substitution; `None` sends no body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_template: Option<String>,
}

impl CallbackTarget {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body_template: None,
        }
    }
}

fn default_method() -> String {
    "POST".to_string()
}

/// A persisted job definition plus its scheduling metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUIDv7 string, primary key.
    pub id: String,
    /// Unique human-readable name.
    pub name: String,
    pub schedule: Schedule,
    pub callback: CallbackTarget,
    /// Total attempt budget per occurrence.
    pub max_retries: u32,
    /// Base interval fed to the back-off policy.
    pub retry_backoff_ms: u64,
    pub enabled: bool,
    /// Next due instant; `None` once a one-shot job has been claimed.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Scheduled-for instant of the most recently claimed occurrence.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Bumped on every write; the claim CAS compares against it.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of one occurrence.
///
/// ```text
/// pending -> claimed -> executing -> succeeded
///               ^            |-----> retry_scheduled --(due)--> claimed
///               |            '-----> failed_terminal
///   (lease expiry resets claimed/executing to pending)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Claimed,
    Executing,
    Succeeded,
    RetryScheduled,
    FailedTerminal,
}

impl RunState {
    pub const ALL: [RunState; 6] = [
        RunState::Pending,
        RunState::Claimed,
        RunState::Executing,
        RunState::Succeeded,
        RunState::RetryScheduled,
        RunState::FailedTerminal,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::FailedTerminal)
    }

    /// The full transition table. Lease recovery (`claimed`/`executing` back
    /// to `pending`) is the only backwards edge.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Executing)
                | (Claimed, Pending)
                | (Executing, Succeeded)
                | (Executing, RetryScheduled)
                | (Executing, FailedTerminal)
                | (Executing, Pending)
                | (RetryScheduled, Claimed)
        )
    }

    /// Checked transition: returns `next` or an `InvalidTransition` error.
    pub fn transition(self, next: RunState) -> Result<RunState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SchedulerError::InvalidTransition { from: self, to: next })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Claimed => "claimed",
            RunState::Executing => "executing",
            RunState::Succeeded => "succeeded",
            RunState::RetryScheduled => "retry_scheduled",
            RunState::FailedTerminal => "failed_terminal",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RunState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown run state: {s}"))
    }
}

/// One occurrence of a job becoming due.
///
/// Carries a snapshot of the job's callback and retry budget taken at claim
/// time so the run can finish even if the job row is deleted underneath it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub job_id: String,
    pub job_name: String,
    pub scheduled_for: DateTime<Utc>,
    /// Attempts started so far (incremented on `claimed -> executing`).
    pub attempt: u32,
    pub state: RunState,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Fresh per claim; stale dispatch tasks carry an older token.
    pub claim_token: Option<String>,
    pub callback: CallbackTarget,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub response_status: Option<u16>,
    pub response_ms: Option<u64>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Whether a failure on the current attempt should be retried.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_retries
    }
}

/// Message carried by the dispatch queue from scheduler to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub job_id: String,
    pub run_id: String,
    /// The attempt number this delivery will perform.
    pub attempt: u32,
    pub claim_token: String,
}

/// Response metadata recorded on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status: u16,
    pub elapsed_ms: u64,
}

/// The worker's verdict for one attempt, applied by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded {
        response: ResponseMeta,
    },
    RetryScheduled {
        next_attempt_at: DateTime<Utc>,
        error: String,
        status: Option<u16>,
    },
    FailedTerminal {
        error: String,
        status: Option<u16>,
    },
}

impl RunOutcome {
    pub fn state(&self) -> RunState {
        match self {
            RunOutcome::Succeeded { .. } => RunState::Succeeded,
            RunOutcome::RetryScheduled { .. } => RunState::RetryScheduled,
            RunOutcome::FailedTerminal { .. } => RunState::FailedTerminal,
        }
    }
}
