//! End-to-end: scheduler tick → queue → worker → HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use cronhook_core::{config::CronhookConfig, ManualClock};
use cronhook_scheduler::{
    retry::Fixed, CallbackTarget, DispatchQueue, JobDefinition, JobStore, MemoryQueue, RunState,
    SchedulerEngine, SchedulerHandle, SqliteJobStore,
};
use cronhook_worker::{HttpExecutor, Processed, Worker};
use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    clock: ManualClock,
    store: Arc<SqliteJobStore>,
    queue: Arc<MemoryQueue>,
    engine: SchedulerEngine,
    handle: SchedulerHandle,
    worker: Worker,
}

fn harness(config: CronhookConfig) -> Harness {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap());
    let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60), 100));
    let engine = SchedulerEngine::new(
        store.clone(),
        queue.clone(),
        Arc::new(clock.clone()),
        config.scheduler.clone(),
    );
    let handle = SchedulerHandle::new(store.clone(), Arc::new(clock.clone()));
    let executor = Arc::new(HttpExecutor::new(&config.worker).unwrap());
    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        executor,
        Arc::new(clock.clone()),
        &config,
    )
    .with_id("worker-test")
    .with_backoff(Arc::new(Fixed { ceiling_ms: 60_000 }));
    Harness {
        clock,
        store,
        queue,
        engine,
        handle,
        worker,
    }
}

impl Harness {
    /// Tick once and process whatever was dispatched.
    async fn step(&self) -> Vec<Processed> {
        self.engine.tick().await.unwrap();
        let mut results = Vec::new();
        while !self.queue.is_empty().await {
            let delivery = self.queue.receive().await.unwrap();
            results.push(self.worker.process(delivery).await.unwrap());
        }
        results
    }
}

#[tokio::test]
async fn successful_callback_carries_headers_and_rendered_body() {
    let server = MockServer::start().await;
    let h = harness(CronhookConfig::default());

    let mut callback = CallbackTarget::post(format!("{}/hook", server.uri()));
    callback
        .headers
        .insert("Authorization".to_string(), "Bearer s3cret".to_string());
    callback.body_template = Some(r#"{"run":"{{run_id}}","job":"{{job_name}}"}"#.to_string());
    let def = JobDefinition {
        callback,
        ..JobDefinition::cron("report", "*/5 * * * *", "")
    };
    let job = h.handle.create(&def).unwrap();

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header_exists("X-Cronhook-Run-Id"))
        .and(header("X-Cronhook-Attempt", "1"))
        .and(header("Authorization", "Bearer s3cret"))
        .and(header("Content-Type", "application/json"))
        .and(body_string_contains(r#""job":"report""#))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    h.clock.advance(chrono::Duration::minutes(5));
    assert_eq!(h.step().await, vec![Processed::Finished(RunState::Succeeded)]);

    let runs = h.store.runs_for_job(&job.id, 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, RunState::Succeeded);
    assert_eq!(runs[0].response_status, Some(204));
    assert!(runs[0].finished_at.is_some());
}

#[tokio::test]
async fn three_failures_exhaust_a_budget_of_three() {
    let server = MockServer::start().await;
    let h = harness(CronhookConfig::default());
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(3)
        .mount(&server)
        .await;

    let mut def = JobDefinition::cron("fragile", "0 0 1 1 *", server.uri());
    def.max_retries = 3;
    def.retry_backoff_ms = 1_000;
    let job = h.handle.create(&def).unwrap();
    h.clock.set(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());

    let mut results = Vec::new();
    for _ in 0..6 {
        results.extend(h.step().await);
        h.clock.advance(chrono::Duration::seconds(5));
    }
    assert_eq!(
        results,
        vec![
            Processed::Finished(RunState::RetryScheduled),
            Processed::Finished(RunState::RetryScheduled),
            Processed::Finished(RunState::FailedTerminal),
        ]
    );

    let run = &h.store.runs_for_job(&job.id, 10).unwrap()[0];
    assert_eq!(run.attempt, 3);
    assert_eq!(run.state, RunState::FailedTerminal);
    assert_eq!(run.last_error.as_deref(), Some("HTTP 503: maintenance"));

    // the job itself keeps its schedule
    let job = h.store.get_job(&job.id).unwrap().unwrap();
    assert!(job.enabled);
    assert_eq!(
        job.next_run_at,
        Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn slow_endpoint_times_out_and_is_retried() {
    let server = MockServer::start().await;
    let mut config = CronhookConfig::default();
    config.worker.callback_timeout_ms = 200;
    let h = harness(config);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let job = h
        .handle
        .create(&JobDefinition::cron("slow", "* * * * *", server.uri()))
        .unwrap();
    h.clock.advance(chrono::Duration::minutes(1));
    assert_eq!(
        h.step().await,
        vec![Processed::Finished(RunState::RetryScheduled)]
    );

    let run = &h.store.runs_for_job(&job.id, 10).unwrap()[0];
    assert!(run
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("timed out")));
    assert_eq!(run.response_status, None);
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_failure() {
    let h = harness(CronhookConfig::default());
    let mut def = JobDefinition::cron("nowhere", "* * * * *", "http://127.0.0.1:9/hook");
    def.max_retries = 1;
    let job = h.handle.create(&def).unwrap();
    h.clock.advance(chrono::Duration::minutes(1));
    assert_eq!(
        h.step().await,
        vec![Processed::Finished(RunState::FailedTerminal)]
    );
    let run = &h.store.runs_for_job(&job.id, 10).unwrap()[0];
    assert!(run
        .last_error
        .as_deref()
        .is_some_and(|e| e.starts_with("transport error")));
}

#[tokio::test]
async fn deleted_job_still_finishes_claimed_run() {
    let server = MockServer::start().await;
    let h = harness(CronhookConfig::default());
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let job = h
        .handle
        .create(&JobDefinition::cron("short-lived", "* * * * *", server.uri()))
        .unwrap();
    h.clock.advance(chrono::Duration::minutes(1));
    h.engine.tick().await.unwrap();
    h.handle.delete(&job.id).unwrap();

    let delivery = h.queue.receive().await.unwrap();
    assert_eq!(
        h.worker.process(delivery).await.unwrap(),
        Processed::Finished(RunState::Succeeded)
    );
    let history = h.handle.history(&job.id, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, RunState::Succeeded);
}

#[tokio::test]
async fn large_error_page_is_cut_to_an_excerpt() {
    let server = MockServer::start().await;
    let h = harness(CronhookConfig::default());
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(200_000)))
        .mount(&server)
        .await;

    let mut def = JobDefinition::cron("noisy", "* * * * *", server.uri());
    def.max_retries = 1;
    let job = h.handle.create(&def).unwrap();
    h.clock.advance(chrono::Duration::minutes(1));
    assert_eq!(
        h.step().await,
        vec![Processed::Finished(RunState::FailedTerminal)]
    );

    let run = &h.store.runs_for_job(&job.id, 10).unwrap()[0];
    let error = run.last_error.as_deref().unwrap();
    assert_eq!(error, format!("HTTP 500: {}", "x".repeat(256)));
}
