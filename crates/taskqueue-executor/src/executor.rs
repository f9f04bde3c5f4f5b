//! Task execution state machine.
//!
//! One `execute` call runs one attempt: resolve the handler, run it under a
//! revocation token, then apply the outcome. Failures increment the retry
//! counter first and compare against `max_retries`; exhaustion produces a
//! terminal failure plus exactly one dead-letter entry. Terminal
//! transitions enqueue their webhook event strictly after the state change
//! is persisted.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskqueue_core::{
    queue::{Broker, Job},
    route_priority, Clock, DeadLetterEntry, DeadLetterId, DeadLetterStore, DeliveryStore,
    Result, Task, TaskEventHandler, TaskId, TaskNotification, TaskStatus, TaskStore, TaskUpdate,
};
use taskqueue_delivery::{
    enqueue_webhook, task_retry_delay, EVENT_FAILED, EVENT_SUCCEEDED,
};

use crate::handlers::HandlerRegistry;

/// Classified result of a single attempt, retry accounting applied.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The handler returned a result.
    Success(Value),

    /// The handler failed and budget remains; `retry_count` is the new
    /// cumulative attempt count.
    RetryableFailure { error: String, retry_count: u32 },

    /// The handler failed and the retry budget is spent.
    TerminalFailure { error: String, retry_count: u32 },
}

/// What `execute` did with the job, for stats and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    Succeeded,
    RetryScheduled,
    DeadLettered,
    Revoked,
    /// Record missing or in a state that makes the job stale.
    Skipped,
}

/// Tracks cancellation tokens for in-flight attempts.
///
/// `cancel` is best-effort: it only reaches attempts currently running on
/// some worker. The record-level revocation is handled by the service
/// regardless.
#[derive(Debug, Default)]
pub struct RevocationRegistry {
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,
}

impl RevocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: TaskId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(id, token.clone());
        }
        token
    }

    fn remove(&self, id: TaskId) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(&id);
        }
    }

    /// Cancels the in-flight attempt for a task, if any.
    pub fn cancel(&self, id: TaskId) -> bool {
        if let Ok(tokens) = self.tokens.lock() {
            if let Some(token) = tokens.get(&id) {
                token.cancel();
                return true;
            }
        }
        false
    }
}

/// Runs task attempts and applies lifecycle transitions.
#[derive(Debug)]
pub struct TaskExecutor {
    tasks: Arc<dyn TaskStore>,
    deliveries: Arc<dyn DeliveryStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    notifier: Arc<dyn TaskEventHandler>,
    revocations: Arc<RevocationRegistry>,
    clock: Arc<dyn Clock>,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        deliveries: Arc<dyn DeliveryStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        notifier: Arc<dyn TaskEventHandler>,
        revocations: Arc<RevocationRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tasks,
            deliveries,
            dead_letters,
            broker,
            registry,
            notifier,
            revocations,
            clock,
        }
    }

    /// Runs one attempt of a task.
    pub async fn execute(&self, task_id: TaskId) -> Result<ExecutionResult> {
        let Some(task) = self.tasks.find_task(task_id).await? else {
            warn!(task_id = %task_id, "task record missing, dropping job");
            return Ok(ExecutionResult::Skipped);
        };

        match task.status {
            TaskStatus::Queued | TaskStatus::Retry => {}
            // cancel raced the job through the queue
            TaskStatus::Revoked => return Ok(ExecutionResult::Skipped),
            status => {
                debug!(task_id = %task_id, %status, "stale job for task, skipping");
                return Ok(ExecutionResult::Skipped);
            }
        }

        self.tasks.mark_started(task_id, self.clock.now_utc()).await?;
        self.notify_status(task_id, TaskStatus::Running, None, None).await;
        info!(
            task_id = %task_id,
            task_type = %task.task_type,
            attempt = task.retry_count + 1,
            "task attempt started"
        );

        let token = self.revocations.register(task_id);
        let attempt = self.run_handler(&task);
        let handler_result = tokio::select! {
            _ = token.cancelled() => {
                self.revocations.remove(task_id);
                info!(task_id = %task_id, "attempt cancelled by revocation");
                return Ok(ExecutionResult::Revoked);
            }
            result = attempt => result,
        };
        self.revocations.remove(task_id);

        // a revoke may have landed while the handler ran; never regress it
        let Some(current) = self.tasks.find_task(task_id).await? else {
            return Ok(ExecutionResult::Skipped);
        };
        if current.status == TaskStatus::Revoked {
            debug!(task_id = %task_id, "task revoked mid-attempt, discarding outcome");
            return Ok(ExecutionResult::Revoked);
        }

        let outcome = self.classify(&task, handler_result).await?;
        self.apply(&task, outcome).await
    }

    async fn run_handler(&self, task: &Task) -> std::result::Result<Value, String> {
        let Some(handler) = self.registry.get(&task.task_type) else {
            return Err(format!("unknown task type: {}", task.task_type));
        };
        handler.run(&task.payload).await.map_err(|e| e.to_string())
    }

    /// Applies retry accounting to a raw handler result.
    ///
    /// The counter is incremented before the budget comparison, so a task
    /// with `max_retries = 3` runs at most three times.
    async fn classify(
        &self,
        task: &Task,
        handler_result: std::result::Result<Value, String>,
    ) -> Result<AttemptOutcome> {
        match handler_result {
            Ok(value) => Ok(AttemptOutcome::Success(value)),
            Err(error) => {
                let retry_count = self
                    .tasks
                    .increment_retry_count(task.id, self.clock.now_utc())
                    .await?;
                if retry_count >= task.max_retries {
                    Ok(AttemptOutcome::TerminalFailure { error, retry_count })
                } else {
                    Ok(AttemptOutcome::RetryableFailure { error, retry_count })
                }
            }
        }
    }

    async fn apply(&self, task: &Task, outcome: AttemptOutcome) -> Result<ExecutionResult> {
        match outcome {
            AttemptOutcome::Success(result) => {
                self.tasks
                    .mark_success(task.id, result.clone(), self.clock.now_utc())
                    .await?;
                self.notify_status(task.id, TaskStatus::Success, Some(result), None).await;
                info!(task_id = %task.id, task_type = %task.task_type, "task succeeded");
                self.emit_webhook(task.id, EVENT_SUCCEEDED).await;
                Ok(ExecutionResult::Succeeded)
            }
            AttemptOutcome::RetryableFailure { error, retry_count } => {
                self.tasks.mark_retry(task.id, self.clock.now_utc()).await?;
                self.notify_status(task.id, TaskStatus::Retry, None, Some(error.clone()))
                    .await;

                let delay = task_retry_delay(task.retry_delay_secs, retry_count);
                let queue = route_priority(task.priority);
                self.broker
                    .enqueue_delayed(queue, Job::ExecuteTask(task.id), delay)
                    .await;
                info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    error = %error,
                    retry_count,
                    max_retries = task.max_retries,
                    delay_secs = delay.as_secs(),
                    "task failed, retry scheduled"
                );
                Ok(ExecutionResult::RetryScheduled)
            }
            AttemptOutcome::TerminalFailure { error, retry_count } => {
                self.tasks
                    .mark_failure(task.id, error.clone(), self.clock.now_utc())
                    .await?;
                self.dead_letter(task, &error, retry_count).await?;
                self.notify_status(task.id, TaskStatus::Failure, None, Some(error.clone()))
                    .await;
                warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    error = %error,
                    retry_count,
                    "task failed permanently, dead-lettered"
                );
                self.emit_webhook(task.id, EVENT_FAILED).await;
                Ok(ExecutionResult::DeadLettered)
            }
        }
    }

    /// Creates the single dead-letter entry for a permanently failed task.
    async fn dead_letter(&self, task: &Task, error: &str, retry_count: u32) -> Result<()> {
        let entry = DeadLetterEntry {
            id: DeadLetterId::new(),
            task_id: task.id,
            task_name: task.name.clone(),
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            error_message: error.to_owned(),
            error_detail: format!(
                "handler error: {error}\ntask_type: {}\nretry_count: {retry_count}",
                task.task_type
            ),
            retry_count,
            created_at: self.clock.now_utc(),
            reprocessed: false,
            reprocessed_at: None,
        };
        self.dead_letters.create_entry(entry).await
    }

    /// Enqueues a webhook for the task's post-transition state.
    ///
    /// Failures here are logged, never propagated; the delivery side channel
    /// must not affect execution outcomes.
    async fn emit_webhook(&self, task_id: TaskId, event: &str) {
        let task = match self.tasks.find_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to load task for webhook");
                return;
            }
        };
        if let Err(e) = enqueue_webhook(
            &task,
            event,
            self.deliveries.as_ref(),
            self.broker.as_ref(),
            self.clock.as_ref(),
        )
        .await
        {
            warn!(task_id = %task_id, event = %event, error = %e, "failed to enqueue webhook");
        }
    }

    async fn notify_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<Value>,
        error_message: Option<String>,
    ) {
        self.notifier
            .handle_notification(TaskNotification::Updated(TaskUpdate {
                task_id,
                status,
                result,
                error_message,
            }))
            .await;
    }
}
