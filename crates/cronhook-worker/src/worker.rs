use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronhook_core::{config::CronhookConfig, Clock};
use cronhook_scheduler::{
    retry::{self, BackoffPolicy},
    Delivery, DispatchQueue, JobStore, Lease, Run, RunOutcome, RunState, SchedulerError,
};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::Result,
    executor::{CallbackExecutor, CallbackOutcome},
};

/// First delay between store write retries; doubles per retry.
const STORE_RETRY_BASE: Duration = Duration::from_millis(50);
const STORE_RETRY_MAX: Duration = Duration::from_secs(2);

/// What became of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// The attempt ran and its outcome was recorded.
    Finished(RunState),
    /// The task's claim was no longer current; nothing ran.
    Stale,
    /// The attempt ran but the run was reclaimed before the outcome landed.
    Superseded,
}

/// Executes dispatch tasks: one callback attempt per accepted delivery.
pub struct Worker {
    id: String,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    executor: Arc<dyn CallbackExecutor>,
    clock: Arc<dyn Clock>,
    backoff: Arc<dyn BackoffPolicy>,
    lease_ms: u64,
    store_retry_attempts: u32,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        executor: Arc<dyn CallbackExecutor>,
        clock: Arc<dyn Clock>,
        config: &CronhookConfig,
    ) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            store,
            queue,
            executor,
            clock,
            backoff: retry::policy_from_config(&config.retry),
            lease_ms: config.scheduler.lease_ms,
            store_retry_attempts: config.worker.store_retry_attempts,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle one delivery end to end.
    ///
    /// The delivery is acked once the store reflects the result (or shows the
    /// task is stale). If the store stays unreachable the delivery is left
    /// in flight: the queue redelivers it and the lease sweep recovers the run.
    pub async fn process(&self, delivery: Delivery) -> Result<Processed> {
        let task = &delivery.task;
        let lease = Lease {
            owner: self.id.clone(),
            token: task.claim_token.clone(),
            expires_at: self.lease_deadline(),
        };

        let started = self
            .with_store_retry(|| self.store.begin_execution(&task.run_id, &lease, self.clock.now()))
            .await?;
        let Some(run) = started else {
            debug!(run_id = %task.run_id, "stale dispatch task dropped");
            self.queue.ack(&delivery.receipt).await?;
            return Ok(Processed::Stale);
        };

        info!(
            job_id = %run.job_id,
            run_id = %run.id,
            attempt = run.attempt,
            url = %run.callback.url,
            "executing callback"
        );
        let outcome = self.executor.execute(&run).await;
        let outcome = self.decide(&run, outcome, self.clock.now());
        let state = outcome.state();

        let recorded = self
            .with_store_retry(|| {
                self.store
                    .finish_run(&run.id, &task.claim_token, &outcome, self.clock.now())
            })
            .await?;
        self.queue.ack(&delivery.receipt).await?;

        if !recorded {
            warn!(run_id = %run.id, "run was reclaimed during the attempt; outcome dropped");
            return Ok(Processed::Superseded);
        }
        match &outcome {
            RunOutcome::Succeeded { response } => info!(
                run_id = %run.id,
                status = response.status,
                elapsed_ms = response.elapsed_ms,
                "callback succeeded"
            ),
            RunOutcome::RetryScheduled {
                next_attempt_at,
                error,
                ..
            } => warn!(
                run_id = %run.id,
                attempt = run.attempt,
                next_attempt_at = %next_attempt_at,
                "callback failed, retry scheduled: {error}"
            ),
            RunOutcome::FailedTerminal { error, .. } => error!(
                run_id = %run.id,
                attempt = run.attempt,
                "callback failed terminally: {error}"
            ),
        }
        Ok(Processed::Finished(state))
    }

    /// Map a callback result onto the run's next state.
    fn decide(&self, run: &Run, outcome: CallbackOutcome, now: DateTime<Utc>) -> RunOutcome {
        match outcome {
            CallbackOutcome::Success(response) => RunOutcome::Succeeded { response },
            CallbackOutcome::Failure {
                error,
                status,
                retryable: true,
            } if run.has_attempts_left() => RunOutcome::RetryScheduled {
                next_attempt_at: retry::next_attempt_at(
                    self.backoff.as_ref(),
                    run.attempt,
                    run.retry_backoff_ms,
                    now,
                ),
                error,
                status,
            },
            CallbackOutcome::Failure { error, status, .. } => {
                RunOutcome::FailedTerminal { error, status }
            }
        }
    }

    fn lease_deadline(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::try_milliseconds(i64::try_from(self.lease_ms).unwrap_or(i64::MAX))
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Retry a store call while it fails for infrastructure reasons.
    async fn with_store_retry<T, F>(&self, mut op: F) -> std::result::Result<T, SchedulerError>
    where
        F: FnMut() -> std::result::Result<T, SchedulerError>,
    {
        let mut delay = STORE_RETRY_BASE;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Err(e) if e.is_infrastructure() && attempt < self.store_retry_attempts => {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "store write failed: {e}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(STORE_RETRY_MAX);
                }
                other => return other,
            }
        }
    }
}

/// Pulls deliveries off the queue and runs up to `concurrency` at once.
pub struct WorkerPool {
    worker: Arc<Worker>,
    queue: Arc<dyn DispatchQueue>,
    semaphore: Arc<Semaphore>,
    concurrency: u32,
}

impl WorkerPool {
    pub fn new(worker: Arc<Worker>, queue: Arc<dyn DispatchQueue>, concurrency: u32) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            worker,
            queue,
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            concurrency,
        }
    }

    /// Run until `shutdown` broadcasts `true`, then wait for in-flight
    /// attempts to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker.id(),
            concurrency = self.concurrency,
            "worker pool started"
        );

        'pool: loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'pool,
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break 'pool;
                    }
                    continue 'pool;
                }
            };

            let delivery = tokio::select! {
                delivery = self.queue.receive() => delivery,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break 'pool;
                    }
                    continue 'pool;
                }
            };

            match delivery {
                Ok(delivery) => {
                    let worker = self.worker.clone();
                    tokio::spawn(async move {
                        let run_id = delivery.task.run_id.clone();
                        if let Err(e) = worker.process(delivery).await {
                            error!(%run_id, "delivery left for redelivery: {e}");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("queue receive failed: {e}");
                    drop(permit);
                    tokio::time::sleep(STORE_RETRY_MAX).await;
                }
            }
        }

        info!("worker pool draining");
        let _ = self.semaphore.acquire_many(self.concurrency).await;
        info!("worker pool stopped");
    }
}
