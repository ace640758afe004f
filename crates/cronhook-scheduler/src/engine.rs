use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronhook_core::{config::SchedulerConfig, Clock};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::Result,
    queue::DispatchQueue,
    schedule::next_occurrence,
    store::{JobStore, Lease, OccurrenceClaim},
    types::{DispatchTask, Job, Run},
};

/// What one tick handed to the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// New occurrences claimed from due jobs.
    pub occurrences: usize,
    /// Pending or retry-due runs re-claimed.
    pub runs: usize,
}

impl TickReport {
    pub fn dispatched(&self) -> usize {
        self.occurrences + self.runs
    }
}

/// Scheduler loop: finds due work, claims it in the store, and enqueues it.
///
/// Any number of engines may share one store. Claims are conditional writes,
/// so for each occurrence exactly one engine wins and only the winner
/// enqueues.
pub struct SchedulerEngine {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    config: SchedulerConfig,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("scheduler-{}", Uuid::new_v4()));
        Self {
            store,
            queue,
            clock,
            instance_id,
            config,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Main event loop. Ticks and sweeps until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(instance_id = %self.instance_id, "scheduler engine started");

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First sweep fires immediately and recovers leases left by a crash.
        let mut sweep =
            tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut backoff: Option<Duration> = None;

        'run: loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.tick().await {
                        Ok(report) => {
                            backoff = None;
                            if report.dispatched() > 0 {
                                debug!(
                                    occurrences = report.occurrences,
                                    runs = report.runs,
                                    "tick dispatched work"
                                );
                            }
                        }
                        Err(e) if e.is_infrastructure() => {
                            let delay = next_backoff(
                                backoff,
                                Duration::from_millis(self.config.tick_ms),
                                Duration::from_millis(self.config.max_backoff_ms),
                            );
                            backoff = Some(delay);
                            error!(delay_ms = delay.as_millis() as u64, "scheduler tick failed: {e}");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                res = shutdown.changed() => {
                                    if res.is_err() || *shutdown.borrow() {
                                        break 'run;
                                    }
                                }
                            }
                        }
                        Err(e) => error!("scheduler tick error: {e}"),
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep() {
                        error!("lease sweep failed: {e}");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break 'run;
                    }
                }
            }
        }
        info!(instance_id = %self.instance_id, "scheduler engine shutting down");
    }

    /// Claim and enqueue everything due at the clock's current instant.
    ///
    /// Due jobs become new runs; pending runs (reset by the sweep) and
    /// retry-scheduled runs whose delay elapsed are claimed again.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for job in self.store.due_jobs(now, self.config.batch_size)? {
            if let Some(run) = self.claim_occurrence(&job, now)? {
                self.dispatch(&run).await?;
                report.occurrences += 1;
            }
        }

        for run in self.store.claimable_runs(now, self.config.batch_size)? {
            let lease = self.lease(now);
            match self.store.claim_run(&run, &lease, now)? {
                Some(claimed) => {
                    self.dispatch(&claimed).await?;
                    report.runs += 1;
                }
                None => debug!(run_id = %run.id, "run claimed elsewhere"),
            }
        }

        Ok(report)
    }

    /// Reset runs whose lease lapsed so the next tick re-claims them.
    pub fn sweep(&self) -> Result<usize> {
        self.store.reclaim_expired(self.clock.now())
    }

    fn claim_occurrence(&self, job: &Job, now: DateTime<Utc>) -> Result<Option<Run>> {
        let scheduled_for = job.next_run_at.unwrap_or(now);
        // Missed occurrences collapse: the following due time is computed
        // from whichever is later, the slot being fired or now.
        let next_run_at = match next_occurrence(&job.schedule, scheduled_for.max(now)) {
            Ok(next) => next,
            Err(e) => {
                error!(job_id = %job.id, "cannot evaluate schedule: {e}");
                return Ok(None);
            }
        };

        let claim = OccurrenceClaim {
            run_id: Uuid::now_v7().to_string(),
            job_id: job.id.clone(),
            expected_version: job.version,
            scheduled_for,
            next_run_at,
            lease: self.lease(now),
            now,
        };
        let run = self.store.claim_occurrence(&claim)?;
        match &run {
            Some(run) => {
                let late_before =
                    millis(self.config.tick_ms).and_then(|d| now.checked_sub_signed(d));
                if late_before.is_some_and(|t| scheduled_for < t) {
                    warn!(
                        job_id = %job.id,
                        scheduled_for = %scheduled_for,
                        "occurrence fired late; missed slots were skipped"
                    );
                }
                info!(
                    job_id = %job.id,
                    run_id = %run.id,
                    name = %job.name,
                    next_run_at = ?next_run_at,
                    "occurrence claimed"
                );
            }
            None => debug!(job_id = %job.id, "occurrence claimed by another instance"),
        }
        Ok(run)
    }

    async fn dispatch(&self, run: &Run) -> Result<()> {
        let Some(claim_token) = run.claim_token.clone() else {
            warn!(run_id = %run.id, "claimed run has no claim token; leaving for sweep");
            return Ok(());
        };
        let task = DispatchTask {
            job_id: run.job_id.clone(),
            run_id: run.id.clone(),
            attempt: run.attempt + 1,
            claim_token,
        };
        // On failure the run stays claimed and the lease sweep recovers it.
        self.queue.enqueue(task).await
    }

    fn lease(&self, now: DateTime<Utc>) -> Lease {
        let expires_at = millis(self.config.lease_ms)
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Lease {
            owner: self.instance_id.clone(),
            token: Uuid::new_v4().to_string(),
            expires_at,
        }
    }
}

fn millis(ms: u64) -> Option<chrono::Duration> {
    chrono::Duration::try_milliseconds(i64::try_from(ms).ok()?)
}

/// Double the previous delay, starting at `base` and capped at `max`.
fn next_backoff(previous: Option<Duration>, base: Duration, max: Duration) -> Duration {
    match previous {
        None => base.min(max),
        Some(prev) => prev.saturating_mul(2).min(max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handle::{JobDefinition, SchedulerHandle},
        queue::MemoryQueue,
        store::SqliteJobStore,
        types::RunState,
    };
    use chrono::TimeZone;
    use cronhook_core::ManualClock;

    struct Fixture {
        store: Arc<SqliteJobStore>,
        queue: Arc<MemoryQueue>,
        clock: ManualClock,
        engine: SchedulerEngine,
        handle: SchedulerHandle,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap());
        let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60), 100));
        let config = SchedulerConfig {
            instance_id: Some("s1".to_string()),
            ..SchedulerConfig::default()
        };
        let engine = SchedulerEngine::new(
            store.clone(),
            queue.clone(),
            Arc::new(clock.clone()),
            config,
        );
        let handle = SchedulerHandle::new(store.clone(), Arc::new(clock.clone()));
        Fixture {
            store,
            queue,
            clock,
            engine,
            handle,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(350);
        let first = next_backoff(None, base, max);
        let second = next_backoff(Some(first), base, max);
        let third = next_backoff(Some(second), base, max);
        assert_eq!(
            [first, second, third],
            [
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350)
            ]
        );
    }

    #[tokio::test]
    async fn huge_tick_interval_does_not_break_late_detection() {
        let f = fixture();
        let config = SchedulerConfig {
            instance_id: Some("s2".to_string()),
            tick_ms: u64::MAX,
            ..SchedulerConfig::default()
        };
        let engine = SchedulerEngine::new(
            f.store.clone(),
            f.queue.clone(),
            Arc::new(f.clock.clone()),
            config,
        );
        f.handle
            .create(&JobDefinition::cron("hourly", "0 * * * *", "https://x.io"))
            .unwrap();
        f.clock.advance(chrono::Duration::hours(3));

        let report = engine.tick().await.unwrap();
        assert_eq!(report.occurrences, 1);
        assert_eq!(f.queue.len().await, 1);
    }

    #[tokio::test]
    async fn nothing_dispatched_before_due() {
        let f = fixture();
        f.handle
            .create(&JobDefinition::cron("five", "*/5 * * * *", "https://x.io"))
            .unwrap();
        let report = f.engine.tick().await.unwrap();
        assert_eq!(report.dispatched(), 0);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn due_job_is_claimed_advanced_and_enqueued() {
        let f = fixture();
        let job = f
            .handle
            .create(&JobDefinition::cron("five", "*/5 * * * *", "https://x.io"))
            .unwrap();
        f.clock.advance(chrono::Duration::minutes(5));

        let report = f.engine.tick().await.unwrap();
        assert_eq!(report.occurrences, 1);

        let delivery = f.queue.receive().await.unwrap();
        assert_eq!(delivery.task.job_id, job.id);
        assert_eq!(delivery.task.attempt, 1);

        let run = f.store.get_run(&delivery.task.run_id).unwrap().unwrap();
        assert_eq!(run.state, RunState::Claimed);
        assert_eq!(run.claim_token.as_deref(), Some(delivery.task.claim_token.as_str()));
        assert_eq!(run.lease_owner.as_deref(), Some("s1"));

        let advanced = f.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(
            advanced.next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 12, 10, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn missed_backlog_fires_once() {
        let f = fixture();
        let job = f
            .handle
            .create(&JobDefinition::cron("minutely", "* * * * *", "https://x.io"))
            .unwrap();
        // scheduler was down for an hour
        f.clock.advance(chrono::Duration::minutes(60));

        assert_eq!(f.engine.tick().await.unwrap().occurrences, 1);
        assert_eq!(f.queue.len().await, 1);
        let advanced = f.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(
            advanced.next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 13, 1, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn one_shot_is_not_rescheduled() {
        let f = fixture();
        let at = f.clock.now() + chrono::Duration::minutes(1);
        let job = f
            .handle
            .create(&JobDefinition::once("once", at, "https://x.io"))
            .unwrap();
        f.clock.advance(chrono::Duration::minutes(2));
        assert_eq!(f.engine.tick().await.unwrap().occurrences, 1);

        let stored = f.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.next_run_at, None);
        assert_eq!(stored.last_run_at, Some(at));
    }

    #[tokio::test]
    async fn disabled_job_is_not_claimed() {
        let f = fixture();
        f.handle
            .create(&JobDefinition::cron("off", "* * * * *", "https://x.io"))
            .unwrap();
        f.handle.disable("off").unwrap();
        f.clock.advance(chrono::Duration::minutes(3));
        assert_eq!(f.engine.tick().await.unwrap().dispatched(), 0);
    }

    #[tokio::test]
    async fn enqueue_failure_leaves_run_for_the_sweep() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap());
        let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        // capacity 1, pre-filled
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60), 1));
        queue
            .enqueue(DispatchTask {
                job_id: "other".to_string(),
                run_id: "other".to_string(),
                attempt: 1,
                claim_token: "t".to_string(),
            })
            .await
            .unwrap();
        let config = SchedulerConfig::default();
        let lease_ms = config.lease_ms as i64;
        let engine = SchedulerEngine::new(store.clone(), queue.clone(), Arc::new(clock.clone()), config);
        let handle = SchedulerHandle::new(store.clone(), Arc::new(clock.clone()));
        let job = handle
            .create(&JobDefinition::cron("full", "* * * * *", "https://x.io"))
            .unwrap();

        clock.advance(chrono::Duration::minutes(1));
        let err = engine.tick().await.unwrap_err();
        assert!(err.is_infrastructure());

        let runs = store.runs_for_job(&job.id, 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, RunState::Claimed);

        // queue drains, lease lapses, sweep resets, next tick re-dispatches
        let stuck = queue.receive().await.unwrap();
        queue.ack(&stuck.receipt).await.unwrap();
        clock.advance(chrono::Duration::milliseconds(lease_ms + 1));
        assert_eq!(engine.sweep().unwrap(), 1);
        let report = engine.tick().await.unwrap();
        assert_eq!(report.runs, 1);
        let delivery = queue.receive().await.unwrap();
        assert_eq!(delivery.task.run_id, runs[0].id);
    }
}
