//! Task queue service.
//!
//! Entry point for the task execution daemon. Wires the in-memory store
//! and broker to the handler registry, delivery pipeline, and worker pool,
//! then runs until a shutdown signal arrives. Operator surfaces (HTTP,
//! CLI) drive the service through [`taskqueue_executor::TaskService`].

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tracing::info;

use taskqueue_core::{
    Clock, MemoryBroker, MemoryStore, RealClock, TaskEventHandler, TaskNotification,
};
use taskqueue_delivery::{ClientConfig, DeliveryWorker, RetryPolicy, WebhookClient};
use taskqueue_executor::{
    HandlerRegistry, PoolConfig, RevocationRegistry, TaskExecutor, TaskService, WorkerPool,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting task queue service");

    let config = Config::from_env()?;
    info!(
        worker_count = config.worker_count,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        webhook_timeout_secs = config.webhook_timeout.as_secs(),
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store = MemoryStore::shared();
    let broker = MemoryBroker::shared(clock.clone());

    let registry = Arc::new(HandlerRegistry::builtin(clock.clone()));
    info!(handlers = ?registry.keys(), "Handler registry assembled");

    let notifier = Arc::new(LoggingEventHandler);
    let revocations = Arc::new(RevocationRegistry::new());

    let client = WebhookClient::new(ClientConfig { timeout: config.webhook_timeout })
        .context("Failed to build webhook HTTP client")?;
    let delivery_worker = Arc::new(DeliveryWorker::new(
        store.clone(),
        store.clone(),
        broker.clone(),
        client,
        RetryPolicy::default(),
        clock.clone(),
    ));

    let executor = Arc::new(TaskExecutor::new(
        store.clone(),
        store.clone(),
        store.clone(),
        broker.clone(),
        registry,
        notifier.clone(),
        revocations.clone(),
        clock.clone(),
    ));

    let _service = TaskService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        broker.clone(),
        delivery_worker.clone(),
        notifier,
        revocations,
        clock.clone(),
    );

    let mut pool = WorkerPool::new(
        PoolConfig {
            worker_count: config.worker_count,
            poll_interval: config.poll_interval,
        },
        broker,
        executor,
        delivery_worker,
        clock,
    );
    pool.spawn_workers().await;

    info!("Task queue service is ready");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    let stats = pool.stats().await;
    info!(
        jobs_processed = stats.jobs_processed,
        tasks_succeeded = stats.tasks_succeeded,
        tasks_dead_lettered = stats.tasks_dead_lettered,
        webhooks_delivered = stats.webhooks_delivered,
        "Final engine stats"
    );

    pool.shutdown_graceful(config.shutdown_grace)
        .await
        .context("Worker pool failed to shut down cleanly")?;

    info!("Task queue service shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,taskqueue=debug"))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Emits task lifecycle notifications to the log.
#[derive(Debug)]
struct LoggingEventHandler;

#[async_trait::async_trait]
impl TaskEventHandler for LoggingEventHandler {
    async fn handle_notification(&self, notification: TaskNotification) {
        match notification {
            TaskNotification::Created(summary) => {
                info!(
                    task_id = %summary.task_id,
                    name = %summary.name,
                    task_type = %summary.task_type,
                    priority = summary.priority,
                    "task created"
                );
            }
            TaskNotification::Updated(update) => {
                info!(
                    task_id = %update.task_id,
                    status = %update.status,
                    error = update.error_message.as_deref().unwrap_or(""),
                    "task status changed"
                );
            }
        }
    }
}

/// Service configuration.
struct Config {
    /// Number of polling workers
    worker_count: usize,
    /// Broker poll interval when queues are empty
    poll_interval: Duration,
    /// Per-request webhook timeout
    webhook_timeout: Duration,
    /// Time allowed for workers to drain on shutdown
    shutdown_grace: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    fn from_env() -> Result<Self> {
        let worker_count = env_parsed("TASKQUEUE_WORKERS", 4)?;
        let poll_interval =
            Duration::from_millis(env_parsed("TASKQUEUE_POLL_INTERVAL_MS", 100)?);
        let webhook_timeout =
            Duration::from_secs(env_parsed("TASKQUEUE_WEBHOOK_TIMEOUT_SECS", 10)?);
        let shutdown_grace =
            Duration::from_secs(env_parsed("TASKQUEUE_SHUTDOWN_GRACE_SECS", 30)?);

        Ok(Self { worker_count, poll_interval, webhook_timeout, shutdown_grace })
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid value for {name}: {raw}")),
        Err(_) => Ok(default),
    }
}
