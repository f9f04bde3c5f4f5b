//! Worker pool with structured concurrency.
//!
//! Workers poll the broker in a loop and dispatch jobs to the task executor
//! or the delivery worker. The pool supervises the spawned tasks and
//! provides graceful shutdown with a timeout; dropping an unshut pool
//! cancels its workers so nothing is orphaned.

use std::{sync::Arc, time::Duration};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskqueue_core::{queue::Job, Broker, Clock};
use taskqueue_delivery::{AttemptResult, DeliveryWorker};

use crate::{
    error::{ExecutorError, Result},
    executor::{ExecutionResult, TaskExecutor},
};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks to spawn.
    pub worker_count: usize,

    /// Idle sleep between polls when every queue is empty.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { worker_count: 4, poll_interval: Duration::from_millis(100) }
    }
}

/// Counters exposed by the running pool.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of active workers.
    pub active_workers: usize,
    /// Jobs popped from the broker since startup.
    pub jobs_processed: u64,
    /// Tasks that reached `success`.
    pub tasks_succeeded: u64,
    /// Tasks that were dead-lettered.
    pub tasks_dead_lettered: u64,
    /// Task attempts that scheduled a retry.
    pub task_retries: u64,
    /// Webhook deliveries acknowledged with 2xx.
    pub webhooks_delivered: u64,
    /// Webhook deliveries abandoned after a ceiling.
    pub webhooks_failed: u64,
}

/// One polling worker.
struct Worker {
    id: usize,
    broker: Arc<dyn Broker>,
    executor: Arc<TaskExecutor>,
    delivery: Arc<DeliveryWorker>,
    stats: Arc<RwLock<EngineStats>>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl Worker {
    async fn run(self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let Some((queue, job)) = self.broker.pop().await else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    _ = self.clock.sleep(self.poll_interval) => continue,
                }
            };

            {
                let mut stats = self.stats.write().await;
                stats.jobs_processed += 1;
            }
            debug!(worker_id = self.id, queue = %queue, ?job, "picked up job");

            match job {
                Job::ExecuteTask(task_id) => match self.executor.execute(task_id).await {
                    Ok(result) => self.record_execution(result).await,
                    Err(e) => {
                        error!(
                            worker_id = self.id,
                            task_id = %task_id,
                            error = %e,
                            "task execution failed internally"
                        );
                    }
                },
                Job::DeliverWebhook { delivery_id, queue_attempt } => {
                    match self.delivery.process(delivery_id, queue_attempt).await {
                        Ok(result) => self.record_delivery(result).await,
                        Err(e) => {
                            error!(
                                worker_id = self.id,
                                delivery_id = %delivery_id,
                                error = %e,
                                "webhook delivery failed internally"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn record_execution(&self, result: ExecutionResult) {
        let mut stats = self.stats.write().await;
        match result {
            ExecutionResult::Succeeded => stats.tasks_succeeded += 1,
            ExecutionResult::DeadLettered => stats.tasks_dead_lettered += 1,
            ExecutionResult::RetryScheduled => stats.task_retries += 1,
            ExecutionResult::Revoked | ExecutionResult::Skipped => {}
        }
    }

    async fn record_delivery(&self, result: AttemptResult) {
        let mut stats = self.stats.write().await;
        match result {
            AttemptResult::Delivered => stats.webhooks_delivered += 1,
            AttemptResult::Exhausted => stats.webhooks_failed += 1,
            AttemptResult::RetryScheduled { .. } | AttemptResult::Skipped => {}
        }
    }
}

/// Supervises the polling workers.
pub struct WorkerPool {
    config: PoolConfig,
    broker: Arc<dyn Broker>,
    executor: Arc<TaskExecutor>,
    delivery: Arc<DeliveryWorker>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        broker: Arc<dyn Broker>,
        executor: Arc<TaskExecutor>,
        delivery: Arc<DeliveryWorker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            broker,
            executor,
            delivery,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawns the configured workers. Returns immediately.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.config.worker_count, "spawning workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = Worker {
                id: worker_id,
                broker: self.broker.clone(),
                executor: self.executor.clone(),
                delivery: self.delivery.clone(),
                stats: self.stats.clone(),
                shutdown: self.cancellation_token.clone(),
                poll_interval: self.config.poll_interval,
                clock: self.clock.clone(),
            };

            let handle = tokio::spawn(async move {
                info!(worker_id, "worker starting");
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "worker terminated with error");
                } else {
                    info!(worker_id, "worker stopped gracefully");
                }
                result
            });
            self.worker_handles.push(handle);
        }
    }

    /// Snapshot of the pool's counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Signals shutdown and waits for workers to drain in-flight jobs.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_secs = timeout.as_secs(),
            "initiating graceful shutdown"
        );
        self.cancellation_token.cancel();

        let drain = async {
            let mut results = Vec::new();
            for (worker_id, handle) in
                std::mem::take(&mut self.worker_handles).into_iter().enumerate()
            {
                match handle.await {
                    Ok(worker_result) => {
                        if let Err(error) = worker_result {
                            warn!(worker_id, error = %error, "worker completed with error");
                        }
                        results.push(Ok(()));
                    }
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked");
                        results.push(Err(ExecutorError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        }));
                    }
                }
            }
            let mut stats = self.stats.write().await;
            stats.active_workers = 0;
            results
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(results) => {
                let panics = results.iter().filter(|r| r.is_err()).count();
                if panics > 0 {
                    warn!(
                        panics,
                        total_workers = results.len(),
                        "some workers panicked during shutdown"
                    );
                }
                info!("worker pool shutdown completed");
                Ok(())
            }
            Err(_) => {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(ExecutorError::shutdown_timeout(timeout))
            }
        }
    }

    /// True while any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active,
                "worker pool dropped with active workers, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}
