use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use cronhook_core::{Clock, CronhookConfig, SystemClock};
use cronhook_scheduler::{
    CallbackTarget, Job, JobDefinition, MemoryQueue, Run, SchedulerEngine, SchedulerHandle,
    SqliteJobStore,
};
use cronhook_worker::{HttpExecutor, Worker, WorkerPool};
use tracing::info;

mod cli;

use cli::{AddArgs, Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cronhook=info,cronhook_scheduler=info,cronhook_worker=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = CronhookConfig::load(cli.config.as_deref()).context("invalid configuration")?;

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    let busy_timeout = Duration::from_millis(config.database.busy_timeout_ms);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let open_store = || -> anyhow::Result<Arc<SqliteJobStore>> {
        let store = SqliteJobStore::open(db_path, busy_timeout)
            .with_context(|| format!("failed to open database at {db_path}"))?;
        Ok(Arc::new(store))
    };

    let handle = SchedulerHandle::new(open_store()?, clock.clone());

    match cli.command {
        Commands::Run => {
            info!(path = %db_path, "opening SQLite database");
            run(&config, open_store()?, open_store()?, clock).await?;
        }
        Commands::Add(args) => {
            let job = handle.create(&definition(args))?;
            println!("created {} ({})", job.name, job.id);
            match job.next_run_at {
                Some(next) => println!("next run at {}", next.to_rfc3339()),
                None => println!("no upcoming run"),
            }
        }
        Commands::List { json } => {
            let jobs = handle.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_jobs(&jobs);
            }
        }
        Commands::Remove { job } => {
            handle.delete(&job)?;
            println!("removed {job}");
        }
        Commands::Enable { job } => {
            let job = handle.enable(&job)?;
            println!("enabled {}", job.name);
        }
        Commands::Disable { job } => {
            let job = handle.disable(&job)?;
            println!("disabled {}", job.name);
        }
        Commands::History { job, limit, json } => {
            let runs = handle.history(&job, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                print_runs(&runs);
            }
        }
    }
    Ok(())
}

/// Run one scheduler engine and one worker pool until Ctrl-C.
async fn run(
    config: &CronhookConfig,
    engine_store: Arc<SqliteJobStore>,
    worker_store: Arc<SqliteJobStore>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<()> {
    let queue = Arc::new(MemoryQueue::from_config(&config.queue));
    let engine = SchedulerEngine::new(
        engine_store,
        queue.clone(),
        clock.clone(),
        config.scheduler.clone(),
    );
    let executor = Arc::new(HttpExecutor::new(&config.worker)?);
    let worker = Arc::new(Worker::new(
        worker_store,
        queue.clone(),
        executor,
        clock,
        config,
    ));
    let pool = WorkerPool::new(worker, queue, config.worker.concurrency);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx.clone()));
    let pool_task = tokio::spawn(pool.run(shutdown_rx));
    info!("cronhook running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    engine_task.await?;
    pool_task.await?;
    Ok(())
}

fn definition(args: AddArgs) -> JobDefinition {
    let mut callback = CallbackTarget::post(args.url);
    callback.method = args.method.to_uppercase();
    callback.headers = args.headers.into_iter().collect();
    callback.body_template = args.body;
    JobDefinition {
        name: args.name,
        cron: args.cron,
        run_at: args.at,
        timezone: args.timezone,
        callback,
        max_retries: args.max_retries,
        retry_backoff_ms: args.backoff_ms,
        enabled: !args.disabled,
    }
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("no jobs");
        return;
    }
    println!("{:<24} {:<8} {:<26} {}", "NAME", "ENABLED", "NEXT RUN", "SCHEDULE");
    for job in jobs {
        let next = job
            .next_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let schedule = match &job.schedule {
            cronhook_scheduler::Schedule::Cron {
                expression,
                timezone,
            } => format!("{expression} ({timezone})"),
            cronhook_scheduler::Schedule::Once { at } => format!("once at {}", at.to_rfc3339()),
        };
        println!("{:<24} {:<8} {:<26} {}", job.name, job.enabled, next, schedule);
    }
}

fn print_runs(runs: &[Run]) {
    if runs.is_empty() {
        println!("no runs");
        return;
    }
    println!(
        "{:<26} {:<16} {:<8} {:<7} {}",
        "SCHEDULED FOR", "STATE", "ATTEMPT", "STATUS", "LAST ERROR"
    );
    for run in runs {
        let status = run
            .response_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<26} {:<16} {:<8} {:<7} {}",
            run.scheduled_for.to_rfc3339(),
            run.state.as_str(),
            run.attempt,
            status,
            run.last_error.as_deref().unwrap_or("")
        );
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
