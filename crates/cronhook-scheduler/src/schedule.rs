use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::{
    cron::CronExpr,
    error::{Result, SchedulerError},
    types::Schedule,
};

/// Compute the next UTC execution time for `schedule` strictly *after* `after`.
///
/// Returns `Ok(None)` when the schedule is exhausted (a `Once` job whose
/// instant is not in the future, or a cron expression that never matches).
/// Pure: the same inputs always give the same answer, which is what lets a
/// recovering scheduler recompute `next_run_at` without coordination.
pub fn next_occurrence(schedule: &Schedule, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        Schedule::Once { at } => Ok(Some(*at).filter(|at| *at > after)),
        Schedule::Cron {
            expression,
            timezone,
        } => {
            let (cron, tz) = parse_cron(expression, timezone)?;
            Ok(cron.next_after(after, tz))
        }
    }
}

/// Check that a schedule can be evaluated at all.
pub fn validate_schedule(schedule: &Schedule) -> Result<()> {
    if let Schedule::Cron {
        expression,
        timezone,
    } = schedule
    {
        parse_cron(expression, timezone)?;
    }
    Ok(())
}

fn parse_cron(expression: &str, timezone: &str) -> Result<(CronExpr, Tz)> {
    let cron = CronExpr::parse(expression)
        .map_err(|e| SchedulerError::InvalidSchedule(format!("{expression}: {e}")))?;
    let tz = timezone
        .parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidSchedule(format!("unknown timezone: {timezone}")))?;
    Ok((cron, tz))
}
