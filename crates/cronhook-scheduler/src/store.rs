//! Durable job and run storage.
//!
//! [`JobStore`] is the only shared mutable state in the system. Every state
//! change that two instances could race on is a conditional write: the write
//! names the state (and version or claim token) it expects, and a write that
//! matches zero rows means another instance got there first.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument, warn};

use crate::{
    db::{self, from_ms, opt_from_ms, to_ms},
    error::{Result, SchedulerError},
    types::{Job, Run, RunOutcome, RunState},
};

/// Time-bounded ownership of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Everything the store needs to turn a due job into a claimed run.
#[derive(Debug, Clone)]
pub struct OccurrenceClaim {
    pub run_id: String,
    pub job_id: String,
    /// The job version the caller read; the claim fails if it moved.
    pub expected_version: i64,
    pub scheduled_for: DateTime<Utc>,
    /// The job's following due time, already computed by the caller.
    pub next_run_at: Option<DateTime<Utc>>,
    pub lease: Lease,
    pub now: DateTime<Utc>,
}

pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `DuplicateJob` if the name is taken.
    fn insert_job(&self, job: &Job) -> Result<()>;

    /// Replace a job's definition. Compare-and-swap on `job.version`;
    /// returns the stored row with its new version.
    fn update_job(&self, job: &Job) -> Result<Job>;

    /// Delete a job row. Runs already claimed are unaffected.
    fn delete_job(&self, id: &str) -> Result<()>;

    fn get_job(&self, id: &str) -> Result<Option<Job>>;

    fn find_job_by_name(&self, name: &str) -> Result<Option<Job>>;

    fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Enabled jobs with `next_run_at <= now` and no non-terminal run.
    fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>>;

    /// Atomically advance the job and create its run in `claimed`.
    /// `Ok(None)` means another instance won (or the job changed).
    fn claim_occurrence(&self, claim: &OccurrenceClaim) -> Result<Option<Run>>;

    /// Runs waiting for a scheduler: `pending`, or `retry_scheduled` and due.
    fn claimable_runs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Run>>;

    /// `pending`/`retry_scheduled` → `claimed`, guarded by `run.version`.
    fn claim_run(&self, run: &Run, lease: &Lease, now: DateTime<Utc>) -> Result<Option<Run>>;

    /// `claimed` → `executing`, guarded by the claim token. Counts an attempt
    /// and hands the lease to `lease.owner`.
    fn begin_execution(
        &self,
        run_id: &str,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>>;

    /// `executing` → outcome state, guarded by the claim token. `Ok(false)`
    /// if the run was reclaimed in the meantime.
    fn finish_run(
        &self,
        run_id: &str,
        claim_token: &str,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Reset `claimed`/`executing` runs whose lease lapsed to `pending`.
    fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    fn get_run(&self, id: &str) -> Result<Option<Run>>;

    /// Most recent runs of a job, newest first.
    fn runs_for_job(&self, job_id: &str, limit: u32) -> Result<Vec<Run>>;
}

const JOB_COLUMNS: &str = "id, name, schedule, callback, max_retries, retry_backoff_ms, enabled,
     next_run_at, last_run_at, version, created_at, updated_at";

const RUN_COLUMNS: &str = "id, job_id, job_name, scheduled_for, attempt, state, last_error,
     next_attempt_at, lease_owner, lease_expires_at, claim_token, callback, max_retries,
     retry_backoff_ms, response_status, response_ms, version, created_at, updated_at, finished_at";

const ACTIVE_RUN_FILTER: &str = "state NOT IN ('succeeded', 'failed_terminal')";

/// SQLite-backed [`JobStore`].
///
/// Wraps a single connection in a `Mutex`. Several stores (in one process or
/// many) may point at the same database file; SQLite's write lock plus the
/// conditional updates below keep them consistent.
pub struct SqliteJobStore {
    db: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap an already-open connection, initialising the schema.
    pub fn new(conn: Connection) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open a database file with WAL and a busy timeout.
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self> {
        Self::new(db::open(path, busy_timeout)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| SchedulerError::Poisoned(e.to_string()))
    }
}

impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, name = %job.name))]
    fn insert_job(&self, job: &Job) -> Result<()> {
        let db = self.conn()?;
        let result = db.execute(
            "INSERT INTO jobs
             (id, name, schedule, callback, max_retries, retry_backoff_ms, enabled,
              next_run_at, last_run_at, version, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                job.id,
                job.name,
                serde_json::to_string(&job.schedule)?,
                serde_json::to_string(&job.callback)?,
                job.max_retries,
                u64_to_sql(job.retry_backoff_ms),
                job.enabled,
                job.next_run_at.map(to_ms),
                job.last_run_at.map(to_ms),
                job.version,
                to_ms(job.created_at),
                to_ms(job.updated_at),
            ],
        );
        match result {
            Ok(_) => {
                debug!("job inserted");
                Ok(())
            }
            Err(e) if is_constraint_violation(&e) => Err(SchedulerError::DuplicateJob {
                name: job.name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, version = job.version))]
    fn update_job(&self, job: &Job) -> Result<Job> {
        let db = self.conn()?;
        let result = db.execute(
            "UPDATE jobs
             SET name = ?1, schedule = ?2, callback = ?3, max_retries = ?4,
                 retry_backoff_ms = ?5, enabled = ?6, next_run_at = ?7,
                 version = version + 1, updated_at = ?8
             WHERE id = ?9 AND version = ?10",
            params![
                job.name,
                serde_json::to_string(&job.schedule)?,
                serde_json::to_string(&job.callback)?,
                job.max_retries,
                u64_to_sql(job.retry_backoff_ms),
                job.enabled,
                job.next_run_at.map(to_ms),
                to_ms(job.updated_at),
                job.id,
                job.version,
            ],
        );
        let changed = match result {
            Ok(n) => n,
            Err(e) if is_constraint_violation(&e) => {
                return Err(SchedulerError::DuplicateJob {
                    name: job.name.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let stored = query_job(&db, "id = ?1", &job.id)?;
        match (changed, stored) {
            (0, None) => Err(SchedulerError::JobNotFound { id: job.id.clone() }),
            (0, Some(_)) => Err(SchedulerError::VersionConflict { id: job.id.clone() }),
            (_, Some(stored)) => Ok(stored),
            (_, None) => Err(SchedulerError::JobNotFound { id: job.id.clone() }),
        }
    }

    #[instrument(skip(self))]
    fn delete_job(&self, id: &str) -> Result<()> {
        let db = self.conn()?;
        let n = db.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let db = self.conn()?;
        query_job(&db, "id = ?1", id)
    }

    fn find_job_by_name(&self, name: &str) -> Result<Option<Job>> {
        let db = self.conn()?;
        query_job(&db, "name = ?1", name)
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at, name"
        ))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs j
             WHERE j.enabled = 1
               AND j.next_run_at IS NOT NULL
               AND j.next_run_at <= ?1
               AND NOT EXISTS (SELECT 1 FROM runs r WHERE r.job_id = j.id AND r.{ACTIVE_RUN_FILTER})
             ORDER BY j.next_run_at
             LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![to_ms(now), limit], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    #[instrument(skip(self, claim), fields(job_id = %claim.job_id, owner = %claim.lease.owner))]
    fn claim_occurrence(&self, claim: &OccurrenceClaim) -> Result<Option<Run>> {
        RunState::Pending.transition(RunState::Claimed)?;

        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // The CAS: only the instance that still sees the version it read, and
        // finds the job due with no live run, advances it.
        let advanced = tx.execute(
            &format!(
                "UPDATE jobs
                 SET next_run_at = ?1, last_run_at = ?2, version = version + 1, updated_at = ?3
                 WHERE id = ?4 AND version = ?5 AND enabled = 1
                   AND next_run_at IS NOT NULL AND next_run_at <= ?3
                   AND NOT EXISTS (SELECT 1 FROM runs WHERE job_id = ?4 AND {ACTIVE_RUN_FILTER})"
            ),
            params![
                claim.next_run_at.map(to_ms),
                to_ms(claim.scheduled_for),
                to_ms(claim.now),
                claim.job_id,
                claim.expected_version,
            ],
        )?;
        if advanced == 0 {
            debug!("claim lost: job moved, disabled, or already has a live run");
            return Ok(None);
        }

        let Some(job) = query_job(&tx, "id = ?1", &claim.job_id)? else {
            return Ok(None);
        };

        let inserted = tx.execute(
            "INSERT INTO runs
             (id, job_id, job_name, scheduled_for, attempt, state, lease_owner,
              lease_expires_at, claim_token, callback, max_retries, retry_backoff_ms,
              version, created_at, updated_at)
             VALUES (?1,?2,?3,?4,0,'claimed',?5,?6,?7,?8,?9,?10,0,?11,?11)",
            params![
                claim.run_id,
                job.id,
                job.name,
                to_ms(claim.scheduled_for),
                claim.lease.owner,
                to_ms(claim.lease.expires_at),
                claim.lease.token,
                serde_json::to_string(&job.callback)?,
                job.max_retries,
                u64_to_sql(job.retry_backoff_ms),
                to_ms(claim.now),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                debug!("claim lost: live run appeared concurrently");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let run = query_run(&tx, &claim.run_id)?;
        tx.commit()?;
        Ok(run)
    }

    fn claimable_runs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Run>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE state = 'pending'
                OR (state = 'retry_scheduled' AND next_attempt_at <= ?1)
             ORDER BY COALESCE(next_attempt_at, scheduled_for)
             LIMIT ?2"
        ))?;
        let runs = stmt
            .query_map(params![to_ms(now), limit], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    #[instrument(skip(self, run, lease), fields(run_id = %run.id, from = %run.state, owner = %lease.owner))]
    fn claim_run(&self, run: &Run, lease: &Lease, now: DateTime<Utc>) -> Result<Option<Run>> {
        run.state.transition(RunState::Claimed)?;

        let db = self.conn()?;
        let n = db.execute(
            "UPDATE runs
             SET state = 'claimed', lease_owner = ?1, lease_expires_at = ?2, claim_token = ?3,
                 next_attempt_at = NULL, version = version + 1, updated_at = ?4
             WHERE id = ?5 AND version = ?6
               AND (state = 'pending' OR (state = 'retry_scheduled' AND next_attempt_at <= ?4))",
            params![
                lease.owner,
                to_ms(lease.expires_at),
                lease.token,
                to_ms(now),
                run.id,
                run.version,
            ],
        )?;
        if n == 0 {
            debug!("run claim lost");
            return Ok(None);
        }
        query_run(&db, &run.id)
    }

    #[instrument(skip(self, lease), fields(owner = %lease.owner))]
    fn begin_execution(
        &self,
        run_id: &str,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE runs
             SET state = 'executing', attempt = attempt + 1, lease_owner = ?1,
                 lease_expires_at = ?2, version = version + 1, updated_at = ?3
             WHERE id = ?4 AND state = 'claimed' AND claim_token = ?5",
            params![
                lease.owner,
                to_ms(lease.expires_at),
                to_ms(now),
                run_id,
                lease.token,
            ],
        )?;
        if n == 0 {
            return Ok(None);
        }
        query_run(&db, run_id)
    }

    #[instrument(skip(self, claim_token, outcome), fields(to = %outcome.state()))]
    fn finish_run(
        &self,
        run_id: &str,
        claim_token: &str,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let state = RunState::Executing.transition(outcome.state())?;
        let (last_error, next_attempt_at, status, elapsed_ms) = match outcome {
            RunOutcome::Succeeded { response } => (
                None,
                None,
                Some(response.status),
                Some(u64_to_sql(response.elapsed_ms)),
            ),
            RunOutcome::RetryScheduled {
                next_attempt_at,
                error,
                status,
            } => (Some(error.as_str()), Some(to_ms(*next_attempt_at)), *status, None),
            RunOutcome::FailedTerminal { error, status } => {
                (Some(error.as_str()), None, *status, None)
            }
        };
        let finished_at = state.is_terminal().then(|| to_ms(now));

        let db = self.conn()?;
        let n = db.execute(
            "UPDATE runs
             SET state = ?1, last_error = COALESCE(?2, last_error), next_attempt_at = ?3,
                 response_status = ?4, response_ms = COALESCE(?5, response_ms),
                 lease_owner = NULL, lease_expires_at = NULL, claim_token = NULL,
                 finished_at = ?6, version = version + 1, updated_at = ?7
             WHERE id = ?8 AND state = 'executing' AND claim_token = ?9",
            params![
                state.as_str(),
                last_error,
                next_attempt_at,
                status,
                elapsed_ms,
                finished_at,
                to_ms(now),
                run_id,
                claim_token,
            ],
        )?;
        if n == 0 {
            warn!(run_id, "run no longer held by this claim; outcome discarded");
            return Ok(false);
        }
        Ok(true)
    }

    #[instrument(skip(self))]
    fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE runs
             SET state = 'pending', lease_owner = NULL, lease_expires_at = NULL,
                 claim_token = NULL, version = version + 1, updated_at = ?1
             WHERE state IN ('claimed', 'executing') AND lease_expires_at < ?1",
            params![to_ms(now)],
        )?;
        if n > 0 {
            info!(count = n, "expired leases reclaimed");
        }
        Ok(n)
    }

    fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let db = self.conn()?;
        query_run(&db, id)
    }

    fn runs_for_job(&self, job_id: &str, limit: u32) -> Result<Vec<Run>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE job_id = ?1
             ORDER BY scheduled_for DESC, created_at DESC
             LIMIT ?2"
        ))?;
        let runs = stmt
            .query_map(params![job_id, limit], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}

fn query_job(conn: &Connection, predicate: &str, value: &str) -> Result<Option<Job>> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE {predicate}"),
            [value],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

fn query_run(conn: &Connection, id: &str) -> Result<Option<Run>> {
    let run = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            [id],
            row_to_run,
        )
        .optional()?;
    Ok(run)
}

/// Map a SQLite row to a `Job`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        schedule: json_column(row, 2)?,
        callback: json_column(row, 3)?,
        max_retries: row.get(4)?,
        retry_backoff_ms: sql_to_u64(row.get(5)?),
        enabled: row.get(6)?,
        next_run_at: opt_from_ms(row.get(7)?),
        last_run_at: opt_from_ms(row.get(8)?),
        version: row.get(9)?,
        created_at: from_ms(row.get(10)?),
        updated_at: from_ms(row.get(11)?),
    })
}

/// Map a SQLite row to a `Run`.
fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let state: String = row.get(5)?;
    let state = state.parse::<RunState>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Run {
        id: row.get(0)?,
        job_id: row.get(1)?,
        job_name: row.get(2)?,
        scheduled_for: from_ms(row.get(3)?),
        attempt: row.get(4)?,
        state,
        last_error: row.get(6)?,
        next_attempt_at: opt_from_ms(row.get(7)?),
        lease_owner: row.get(8)?,
        lease_expires_at: opt_from_ms(row.get(9)?),
        claim_token: row.get(10)?,
        callback: json_column(row, 11)?,
        max_retries: row.get(12)?,
        retry_backoff_ms: sql_to_u64(row.get(13)?),
        response_status: row.get(14)?,
        response_ms: row.get::<_, Option<i64>>(15)?.map(sql_to_u64),
        version: row.get(16)?,
        created_at: from_ms(row.get(17)?),
        updated_at: from_ms(row.get(18)?),
        finished_at: opt_from_ms(row.get(19)?),
    })
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

// SQLite integers are i64; durations beyond i64::MAX ms are clamped.
fn u64_to_sql(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn sql_to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallbackTarget, ResponseMeta, Schedule};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn job(name: &str, next_run_at: Option<DateTime<Utc>>) -> Job {
        Job {
            id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            schedule: Schedule::cron("*/5 * * * *"),
            callback: CallbackTarget::post("http://localhost/hook"),
            max_retries: 3,
            retry_backoff_ms: 1_000,
            enabled: true,
            next_run_at,
            last_run_at: None,
            version: 0,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    fn lease(owner: &str, expires_at: DateTime<Utc>) -> Lease {
        Lease {
            owner: owner.to_string(),
            token: Uuid::new_v4().to_string(),
            expires_at,
        }
    }

    fn claim_for(job: &Job, owner: &str, now: DateTime<Utc>) -> OccurrenceClaim {
        OccurrenceClaim {
            run_id: Uuid::now_v7().to_string(),
            job_id: job.id.clone(),
            expected_version: job.version,
            scheduled_for: job.next_run_at.unwrap(),
            next_run_at: job.next_run_at.map(|t| t + ChronoDuration::minutes(5)),
            lease: lease(owner, now + ChronoDuration::minutes(1)),
            now,
        }
    }

    #[test]
    fn insert_rejects_duplicate_name() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        store.insert_job(&job("nightly", None)).unwrap();
        let err = store.insert_job(&job("nightly", None)).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateJob { .. }));
    }

    #[test]
    fn update_is_compare_and_swap() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let j = job("a", Some(t0()));
        store.insert_job(&j).unwrap();

        let mut edit = j.clone();
        edit.enabled = false;
        let stored = store.update_job(&edit).unwrap();
        assert_eq!(stored.version, 1);
        assert!(!stored.enabled);

        // stale version loses
        let err = store.update_job(&edit).unwrap_err();
        assert!(matches!(err, SchedulerError::VersionConflict { .. }));

        let mut ghost = j.clone();
        ghost.id = "missing".to_string();
        assert!(matches!(
            store.update_job(&ghost).unwrap_err(),
            SchedulerError::JobNotFound { .. }
        ));
    }

    #[test]
    fn due_jobs_filters_disabled_future_and_busy() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let due = job("due", Some(t0()));
        let future = job("future", Some(t0() + ChronoDuration::hours(1)));
        let mut disabled = job("disabled", Some(t0()));
        disabled.enabled = false;
        let retired = job("retired", None);
        for j in [&due, &future, &disabled, &retired] {
            store.insert_job(j).unwrap();
        }

        let names: Vec<_> = store
            .due_jobs(t0(), 10)
            .unwrap()
            .into_iter()
            .map(|j| j.name)
            .collect();
        assert_eq!(names, vec!["due"]);

        store.claim_occurrence(&claim_for(&due, "s1", t0())).unwrap().unwrap();
        // advanced past now and holds a live run
        assert!(store.due_jobs(t0() + ChronoDuration::minutes(10), 10).unwrap().is_empty());
    }

    #[test]
    fn only_one_claim_wins_for_the_same_read() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let j = job("race", Some(t0()));
        store.insert_job(&j).unwrap();

        let first = store.claim_occurrence(&claim_for(&j, "s1", t0())).unwrap();
        let second = store.claim_occurrence(&claim_for(&j, "s2", t0())).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        let run = first.unwrap();
        assert_eq!(run.state, RunState::Claimed);
        assert_eq!(run.attempt, 0);
        assert_eq!(run.lease_owner.as_deref(), Some("s1"));
        assert_eq!(run.scheduled_for, t0());

        let stored = store.get_job(&j.id).unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.last_run_at, Some(t0()));
        assert_eq!(stored.next_run_at, Some(t0() + ChronoDuration::minutes(5)));
    }

    #[test]
    fn no_second_live_run_even_with_fresh_version() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let j = job("overlap", Some(t0()));
        store.insert_job(&j).unwrap();
        store.claim_occurrence(&claim_for(&j, "s1", t0())).unwrap().unwrap();

        // Re-read the advanced job and try to claim its next occurrence while
        // the first run is still live.
        let later = t0() + ChronoDuration::minutes(5);
        let advanced = store.get_job(&j.id).unwrap().unwrap();
        assert!(store
            .claim_occurrence(&claim_for(&advanced, "s1", later))
            .unwrap()
            .is_none());
    }

    #[test]
    fn execution_and_finish_are_token_guarded() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let j = job("exec", Some(t0()));
        store.insert_job(&j).unwrap();
        let claim = claim_for(&j, "s1", t0());
        let run = store.claim_occurrence(&claim).unwrap().unwrap();

        let mut wrong = claim.lease.clone();
        wrong.token = "stale".to_string();
        assert!(store.begin_execution(&run.id, &wrong, t0()).unwrap().is_none());

        let worker_lease = Lease {
            owner: "w1".to_string(),
            ..claim.lease.clone()
        };
        let running = store
            .begin_execution(&run.id, &worker_lease, t0())
            .unwrap()
            .unwrap();
        assert_eq!(running.state, RunState::Executing);
        assert_eq!(running.attempt, 1);
        assert_eq!(running.lease_owner.as_deref(), Some("w1"));

        // a second delivery of the same task cannot start it again
        assert!(store
            .begin_execution(&run.id, &worker_lease, t0())
            .unwrap()
            .is_none());

        let outcome = RunOutcome::Succeeded {
            response: ResponseMeta {
                status: 204,
                elapsed_ms: 12,
            },
        };
        assert!(!store.finish_run(&run.id, "stale", &outcome, t0()).unwrap());
        assert!(store
            .finish_run(&run.id, &claim.lease.token, &outcome, t0())
            .unwrap());
        // terminal: cannot finish twice
        assert!(!store
            .finish_run(&run.id, &claim.lease.token, &outcome, t0())
            .unwrap());

        let done = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(done.state, RunState::Succeeded);
        assert_eq!(done.response_status, Some(204));
        assert_eq!(done.response_ms, Some(12));
        assert_eq!(done.finished_at, Some(t0()));
        assert!(done.claim_token.is_none());
    }

    #[test]
    fn retry_scheduled_runs_become_claimable_when_due() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let j = job("retry", Some(t0()));
        store.insert_job(&j).unwrap();
        let claim = claim_for(&j, "s1", t0());
        let run = store.claim_occurrence(&claim).unwrap().unwrap();
        store.begin_execution(&run.id, &claim.lease, t0()).unwrap().unwrap();

        let retry_at = t0() + ChronoDuration::seconds(1);
        store
            .finish_run(
                &run.id,
                &claim.lease.token,
                &RunOutcome::RetryScheduled {
                    next_attempt_at: retry_at,
                    error: "HTTP 503".to_string(),
                    status: Some(503),
                },
                t0(),
            )
            .unwrap();

        assert!(store.claimable_runs(t0(), 10).unwrap().is_empty());
        let ready = store.claimable_runs(retry_at, 10).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].state, RunState::RetryScheduled);
        assert_eq!(ready[0].last_error.as_deref(), Some("HTTP 503"));

        let reclaimed = store
            .claim_run(&ready[0], &lease("s2", retry_at + ChronoDuration::minutes(1)), retry_at)
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.state, RunState::Claimed);
        assert!(reclaimed.next_attempt_at.is_none());
        // the stale snapshot cannot claim again
        assert!(store
            .claim_run(&ready[0], &lease("s3", retry_at), retry_at)
            .unwrap()
            .is_none());
    }

    #[test]
    fn expired_leases_are_reset_to_pending() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let j = job("crash", Some(t0()));
        store.insert_job(&j).unwrap();
        let claim = claim_for(&j, "s1", t0());
        let run = store.claim_occurrence(&claim).unwrap().unwrap();
        store.begin_execution(&run.id, &claim.lease, t0()).unwrap().unwrap();

        assert_eq!(store.reclaim_expired(t0()).unwrap(), 0);
        let after_expiry = claim.lease.expires_at + ChronoDuration::seconds(1);
        assert_eq!(store.reclaim_expired(after_expiry).unwrap(), 1);

        let pending = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(pending.state, RunState::Pending);
        assert_eq!(pending.attempt, 1);
        assert!(pending.claim_token.is_none());

        // the crashed worker's late outcome is rejected
        assert!(!store
            .finish_run(
                &run.id,
                &claim.lease.token,
                &RunOutcome::FailedTerminal {
                    error: "late".to_string(),
                    status: None
                },
                after_expiry,
            )
            .unwrap());
    }

    #[test]
    fn runs_survive_job_deletion() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let j = job("ephemeral", Some(t0()));
        store.insert_job(&j).unwrap();
        let claim = claim_for(&j, "s1", t0());
        let run = store.claim_occurrence(&claim).unwrap().unwrap();

        store.delete_job(&j.id).unwrap();
        assert!(store.get_job(&j.id).unwrap().is_none());

        let running = store.begin_execution(&run.id, &claim.lease, t0()).unwrap().unwrap();
        assert_eq!(running.callback.url, "http://localhost/hook");
        assert_eq!(running.max_retries, 3);
        assert_eq!(store.runs_for_job(&j.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn invalid_transition_is_rejected_before_touching_the_db() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let j = job("t", Some(t0()));
        store.insert_job(&j).unwrap();
        let claim = claim_for(&j, "s1", t0());
        let mut run = store.claim_occurrence(&claim).unwrap().unwrap();
        run.state = RunState::Succeeded;
        let err = store.claim_run(&run, &claim.lease, t0()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
    }
}
