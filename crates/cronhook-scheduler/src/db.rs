use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` and `runs` tables (idempotent). Timestamps are stored
/// as Unix milliseconds so range predicates compare numerically.
///
/// `runs` has no foreign key to `jobs`: a run that was claimed before its job
/// was deleted still finishes. The partial unique index allows at most one
/// non-terminal run per job, which is the no-overlap rule enforced by the
/// store itself rather than by callers.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id               TEXT    NOT NULL PRIMARY KEY,
            name             TEXT    NOT NULL UNIQUE,
            schedule         TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            callback         TEXT    NOT NULL,   -- JSON-encoded CallbackTarget
            max_retries      INTEGER NOT NULL,
            retry_backoff_ms INTEGER NOT NULL,
            enabled          INTEGER NOT NULL DEFAULT 1,
            next_run_at      INTEGER,            -- unix ms or NULL
            last_run_at      INTEGER,
            version          INTEGER NOT NULL DEFAULT 0,
            created_at       INTEGER NOT NULL,
            updated_at       INTEGER NOT NULL
        ) STRICT;

        -- Efficient polling: WHERE enabled = 1 AND next_run_at <= ?
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (enabled, next_run_at);

        CREATE TABLE IF NOT EXISTS runs (
            id               TEXT    NOT NULL PRIMARY KEY,
            job_id           TEXT    NOT NULL,
            job_name         TEXT    NOT NULL,
            scheduled_for    INTEGER NOT NULL,
            attempt          INTEGER NOT NULL DEFAULT 0,
            state            TEXT    NOT NULL,
            last_error       TEXT,
            next_attempt_at  INTEGER,
            lease_owner      TEXT,
            lease_expires_at INTEGER,
            claim_token      TEXT,
            callback         TEXT    NOT NULL,   -- snapshot taken at claim time
            max_retries      INTEGER NOT NULL,
            retry_backoff_ms INTEGER NOT NULL,
            response_status  INTEGER,
            response_ms      INTEGER,
            version          INTEGER NOT NULL DEFAULT 0,
            created_at       INTEGER NOT NULL,
            updated_at       INTEGER NOT NULL,
            finished_at      INTEGER
        ) STRICT;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active
            ON runs (job_id)
            WHERE state NOT IN ('succeeded', 'failed_terminal');

        CREATE INDEX IF NOT EXISTS idx_runs_state ON runs (state, next_attempt_at);
        CREATE INDEX IF NOT EXISTS idx_runs_lease ON runs (state, lease_expires_at);
        CREATE INDEX IF NOT EXISTS idx_runs_history ON runs (job_id, scheduled_for);
        ",
    )?;
    Ok(())
}

/// Open (or create) a database file with the pragmas every connection needs.
///
/// WAL lets several connections, possibly in different processes, read while
/// one writes; `busy_timeout` makes contending writers wait instead of failing.
pub fn open(path: &str, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    init_db(&conn)?;
    Ok(conn)
}

pub(crate) fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}
