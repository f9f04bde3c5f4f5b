//! Operator-facing service facade.
//!
//! Submission, cancellation, manual retry, manual webhook triggers, replay,
//! dead-letter reprocessing, and stats. The excluded transport layer (HTTP,
//! CLI) calls these methods; they own validation and the legality of state
//! transitions, while the executor owns what happens on workers.

use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tracing::info;

use taskqueue_core::{
    queue::{Broker, Job},
    route_priority, Clock, CoreError, DeadLetterEntry, DeadLetterId, DeadLetterStore, DeliveryId,
    DeliveryStore, NewTask, QueueName, Result, Task, TaskEventHandler, TaskFilter, TaskId,
    TaskNotification, TaskStatus, TaskStore, TaskSummary, TaskUpdate, WebhookDelivery,
};
use taskqueue_delivery::{
    enqueue_webhook, DeliveryError, DeliveryWorker, EVENT_FAILED, EVENT_REVOKED, EVENT_SUCCEEDED,
    EVENT_UPDATED,
};

use crate::executor::RevocationRegistry;

/// Aggregate counters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub total_tasks: usize,
    pub by_status: HashMap<String, usize>,
    pub queue_depths: HashMap<String, usize>,
    pub dead_letters: usize,
    /// Mean run duration over completed tasks, seconds.
    pub avg_duration_secs: Option<f64>,
}

/// Coordinates stores, broker, and revocation for operator requests.
#[derive(Debug)]
pub struct TaskService {
    tasks: Arc<dyn TaskStore>,
    deliveries: Arc<dyn DeliveryStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    broker: Arc<dyn Broker>,
    delivery_worker: Arc<DeliveryWorker>,
    notifier: Arc<dyn TaskEventHandler>,
    revocations: Arc<RevocationRegistry>,
    clock: Arc<dyn Clock>,
}

impl TaskService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        deliveries: Arc<dyn DeliveryStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        broker: Arc<dyn Broker>,
        delivery_worker: Arc<DeliveryWorker>,
        notifier: Arc<dyn TaskEventHandler>,
        revocations: Arc<RevocationRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tasks,
            deliveries,
            dead_letters,
            broker,
            delivery_worker,
            notifier,
            revocations,
            clock,
        }
    }

    /// Validates and persists a new task, then enqueues it.
    ///
    /// `task_type` is deliberately not checked against the registry: an
    /// unregistered type enters the queue and fails at execution time,
    /// burning its retry budget like any other failure.
    pub async fn submit(&self, params: NewTask) -> Result<TaskId> {
        validate_submission(&params)?;

        let now = self.clock.now_utc();
        let task = Task::create(params, now);
        let task_id = task.id;
        let queue = route_priority(task.priority);
        let scheduled_at = task.scheduled_at;

        self.tasks.create_task(task.clone()).await?;
        self.notifier
            .handle_notification(TaskNotification::Created(TaskSummary {
                task_id,
                name: task.name.clone(),
                task_type: task.task_type.clone(),
                status: TaskStatus::Pending,
                priority: task.priority,
                created_at: now,
            }))
            .await;

        self.tasks.mark_queued(task_id, now).await?;

        let delay = scheduled_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or_default();
        if delay.is_zero() {
            self.broker.enqueue(queue, Job::ExecuteTask(task_id)).await;
        } else {
            self.broker
                .enqueue_delayed(queue, Job::ExecuteTask(task_id), delay)
                .await;
        }

        info!(
            task_id = %task_id,
            task_type = %task.task_type,
            queue = %queue,
            priority = task.priority,
            delayed_secs = delay.as_secs(),
            "task submitted"
        );
        Ok(task_id)
    }

    /// Revokes a pending, queued, or running task.
    ///
    /// The record transition always applies; termination of an in-flight
    /// attempt is best-effort via its cancellation token.
    pub async fn cancel(&self, task_id: TaskId) -> Result<()> {
        // the store checks cancellability and writes under one lock, so a
        // worker that finishes the task first wins the race and this call
        // fails with InvalidTransition instead of regressing the record
        self.tasks.mark_revoked(task_id, self.clock.now_utc()).await?;
        let interrupted = self.revocations.cancel(task_id);
        self.notifier
            .handle_notification(TaskNotification::Updated(TaskUpdate {
                task_id,
                status: TaskStatus::Revoked,
                result: None,
                error_message: None,
            }))
            .await;

        info!(task_id = %task_id, interrupted, "task revoked");
        self.emit_webhook(task_id, EVENT_REVOKED).await?;
        Ok(())
    }

    /// Re-queues a failed or revoked task at the front of its queue.
    ///
    /// `retry_count` is preserved as cumulative history: if the budget was
    /// already exhausted, the next failure dead-letters immediately.
    pub async fn retry(&self, task_id: TaskId) -> Result<()> {
        let task = self.get_task(task_id).await?;
        if !task.status.can_retry() {
            return Err(CoreError::InvalidTransition { status: task.status, action: "retry" });
        }

        self.tasks.reset_for_retry(task_id, self.clock.now_utc()).await?;
        self.notifier
            .handle_notification(TaskNotification::Updated(TaskUpdate {
                task_id,
                status: TaskStatus::Queued,
                result: None,
                error_message: None,
            }))
            .await;
        self.broker
            .enqueue_front(route_priority(task.priority), Job::ExecuteTask(task_id))
            .await;

        info!(task_id = %task_id, retry_count = task.retry_count, "task manually retried");
        Ok(())
    }

    /// Manually enqueues a webhook for a task.
    ///
    /// Without an explicit event, one is derived from the current status.
    /// Returns the event used and the delivery ID, or `None` when the
    /// task's filter or missing callback URL suppressed it.
    pub async fn trigger_webhook(
        &self,
        task_id: TaskId,
        event: Option<String>,
    ) -> Result<(String, Option<DeliveryId>)> {
        let task = self.get_task(task_id).await?;
        let event = event.unwrap_or_else(|| default_event(task.status).to_owned());

        let delivery_id = enqueue_webhook(
            &task,
            &event,
            self.deliveries.as_ref(),
            self.broker.as_ref(),
            self.clock.as_ref(),
        )
        .await
        .map_err(flatten_delivery_error)?;

        Ok((event, delivery_id))
    }

    /// Replays a past delivery: clones its frozen request into a new record
    /// with a fresh attempt budget.
    pub async fn replay_delivery(&self, delivery_id: DeliveryId) -> Result<DeliveryId> {
        self.delivery_worker
            .replay(delivery_id)
            .await
            .map_err(flatten_delivery_error)
    }

    /// Creates a fresh task from a dead-letter entry and marks the entry
    /// reprocessed. Entries can only be reprocessed once.
    pub async fn reprocess_dead_letter(&self, entry_id: DeadLetterId) -> Result<TaskId> {
        let Some(entry) = self.dead_letters.find_entry(entry_id).await? else {
            return Err(CoreError::not_found(format!("dead-letter entry {entry_id}")));
        };
        if entry.reprocessed {
            return Err(CoreError::conflict(format!(
                "dead-letter entry {entry_id} was already reprocessed"
            )));
        }

        let new_task_id = self
            .submit(NewTask {
                name: format!("[Reprocessed] {}", entry.task_name),
                task_type: entry.task_type.clone(),
                payload: entry.payload.clone(),
                ..Default::default()
            })
            .await?;
        self.dead_letters
            .mark_reprocessed(entry_id, self.clock.now_utc())
            .await?;

        info!(
            entry_id = %entry_id,
            original_task_id = %entry.task_id,
            new_task_id = %new_task_id,
            "dead-letter entry reprocessed"
        );
        Ok(new_task_id)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task> {
        self.tasks
            .find_task(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        self.tasks.list_tasks(filter).await
    }

    pub async fn list_deliveries(&self, task_id: TaskId) -> Result<Vec<WebhookDelivery>> {
        self.deliveries.list_deliveries_for_task(task_id).await
    }

    pub async fn list_dead_letters(
        &self,
        include_reprocessed: bool,
    ) -> Result<Vec<DeadLetterEntry>> {
        self.dead_letters.list_entries(include_reprocessed).await
    }

    /// Aggregate counters over tasks, queues, and the dead-letter queue.
    pub async fn stats(&self) -> Result<ServiceStats> {
        let tasks = self.tasks.list_tasks(TaskFilter::default()).await?;

        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut durations = Vec::new();
        for task in &tasks {
            *by_status.entry(task.status.to_string()).or_default() += 1;
            if let Some(duration) = task.duration_secs() {
                durations.push(duration);
            }
        }
        let avg_duration_secs = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<f64>() / durations.len() as f64)
        };

        let mut queue_depths = HashMap::new();
        for queue in QueueName::ALL {
            queue_depths.insert(queue.to_string(), self.broker.depth(queue).await);
        }

        let dead_letters = self.dead_letters.list_entries(false).await?.len();

        Ok(ServiceStats {
            total_tasks: tasks.len(),
            by_status,
            queue_depths,
            dead_letters,
            avg_duration_secs,
        })
    }

    async fn emit_webhook(&self, task_id: TaskId, event: &str) -> Result<()> {
        let task = self.get_task(task_id).await?;
        enqueue_webhook(
            &task,
            event,
            self.deliveries.as_ref(),
            self.broker.as_ref(),
            self.clock.as_ref(),
        )
        .await
        .map_err(flatten_delivery_error)?;
        Ok(())
    }
}

/// Default manual-trigger event for a task's current status.
fn default_event(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Success => EVENT_SUCCEEDED,
        TaskStatus::Failure => EVENT_FAILED,
        TaskStatus::Revoked => EVENT_REVOKED,
        _ => EVENT_UPDATED,
    }
}

fn validate_submission(params: &NewTask) -> Result<()> {
    if params.name.trim().is_empty() {
        return Err(CoreError::invalid_input("task name must not be empty"));
    }
    if params.task_type.trim().is_empty() {
        return Err(CoreError::invalid_input("task_type must not be empty"));
    }
    if let Some(url) = params.callback_url.as_deref() {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(CoreError::invalid_input(format!(
                "callback_url must be an http(s) URL, got: {url}"
            )));
        }
    }
    if params.callback_max_attempts == Some(0) {
        return Err(CoreError::invalid_input("callback_max_attempts must be at least 1"));
    }
    Ok(())
}

fn flatten_delivery_error(error: DeliveryError) -> CoreError {
    match error {
        DeliveryError::Core(core) => core,
        other => CoreError::invalid_input(other.to_string()),
    }
}
