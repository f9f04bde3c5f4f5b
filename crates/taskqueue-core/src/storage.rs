//! Storage contracts and the in-memory implementation.
//!
//! Persistence is an injected collaborator: the executor and delivery
//! pipeline talk to narrow async traits with field-scoped update methods,
//! never to a concrete store. Partial updates are deliberate, concurrent
//! writers touch disjoint field sets (executor owns lifecycle fields, the
//! delivery worker owns `callback_*`).

use std::{cmp::Reverse, collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    error::{CoreError, Result},
    models::{
        CallbackStatus, DeadLetterEntry, DeadLetterId, DeliveryId, DeliveryStatus, Task, TaskId,
        TaskStatus, WebhookDelivery,
    },
};

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub priority: Option<i32>,
}

/// Partial update of a task's callback bookkeeping fields.
///
/// `status: None` leaves `callback_status` untouched (the common case while
/// retries are still pending).
#[derive(Debug, Clone, Default)]
pub struct CallbackOutcome {
    pub status: Option<CallbackStatus>,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

/// Storage operations on task records.
#[async_trait]
pub trait TaskStore: Send + Sync + std::fmt::Debug {
    async fn create_task(&self, task: Task) -> Result<()>;

    async fn find_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Lists tasks matching the filter, newest first.
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>>;

    async fn mark_queued(&self, id: TaskId, now: DateTime<Utc>) -> Result<()>;

    async fn mark_started(&self, id: TaskId, now: DateTime<Utc>) -> Result<()>;

    async fn mark_success(&self, id: TaskId, result: Value, now: DateTime<Utc>) -> Result<()>;

    async fn mark_failure(&self, id: TaskId, error: String, now: DateTime<Utc>) -> Result<()>;

    async fn mark_retry(&self, id: TaskId, now: DateTime<Utc>) -> Result<()>;

    /// Transitions to `Revoked`, checking cancellability and writing under
    /// the same lock. Fails with `InvalidTransition` if the task has moved
    /// to a state that no longer allows cancellation, so a record that
    /// completed between an external status read and this call is never
    /// regressed.
    async fn mark_revoked(&self, id: TaskId, now: DateTime<Utc>) -> Result<()>;

    /// Atomically increments `retry_count` and returns the new value.
    async fn increment_retry_count(&self, id: TaskId, now: DateTime<Utc>) -> Result<u32>;

    /// Puts a terminally failed or revoked task back in `queued`, clearing
    /// the previous run's outcome fields. `retry_count` is preserved.
    async fn reset_for_retry(&self, id: TaskId, now: DateTime<Utc>) -> Result<()>;

    /// Increments `callback_attempts` and stamps `callback_last_attempt_at`.
    async fn record_callback_attempt(&self, id: TaskId, now: DateTime<Utc>) -> Result<()>;

    async fn record_callback_outcome(
        &self,
        id: TaskId,
        outcome: CallbackOutcome,
        now: DateTime<Utc>,
    ) -> Result<()>;
}

/// Storage operations on webhook delivery records.
#[async_trait]
pub trait DeliveryStore: Send + Sync + std::fmt::Debug {
    async fn create_delivery(&self, delivery: WebhookDelivery) -> Result<()>;

    async fn find_delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>>;

    /// Increments `attempts`, stamps `last_attempt_at`, and returns the new
    /// attempt count.
    async fn begin_attempt(&self, id: DeliveryId, now: DateTime<Utc>) -> Result<u32>;

    /// Records the outcome of an attempt (status, captured response, error).
    async fn record_outcome(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        response_status_code: Option<u16>,
        response_body: Option<String>,
        error: Option<String>,
    ) -> Result<()>;

    /// Deliveries for a task, newest first.
    async fn list_deliveries_for_task(&self, task_id: TaskId) -> Result<Vec<WebhookDelivery>>;
}

/// Storage operations on the dead-letter queue.
#[async_trait]
pub trait DeadLetterStore: Send + Sync + std::fmt::Debug {
    async fn create_entry(&self, entry: DeadLetterEntry) -> Result<()>;

    async fn find_entry(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>>;

    /// Entries newest first; `include_reprocessed=false` hides handled ones.
    async fn list_entries(&self, include_reprocessed: bool) -> Result<Vec<DeadLetterEntry>>;

    async fn mark_reprocessed(&self, id: DeadLetterId, now: DateTime<Utc>) -> Result<()>;
}

/// In-memory store backing all three contracts.
///
/// The production deployment of this service keeps its working set in
/// memory; durability sits behind the same traits when needed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    deliveries: RwLock<HashMap<DeliveryId, WebhookDelivery>>,
    dead_letters: RwLock<HashMap<DeadLetterId, DeadLetterEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for shared ownership.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    async fn update_task<F>(&self, id: TaskId, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("task {id}")))?;
        apply(task);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, task: Task) -> Result<()> {
        self.tasks.write().await.insert(task.id, task);
        Ok(())
    }

    async fn find_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks
            .values()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| {
                filter
                    .task_type
                    .as_deref()
                    .map_or(true, |ty| t.task_type == ty)
            })
            .filter(|t| filter.priority.map_or(true, |p| t.priority == p))
            .cloned()
            .collect();
        matched.sort_by_key(|t| Reverse(t.created_at));
        Ok(matched)
    }

    async fn mark_queued(&self, id: TaskId, now: DateTime<Utc>) -> Result<()> {
        self.update_task(id, |t| {
            t.status = TaskStatus::Queued;
            t.updated_at = now;
        })
        .await
    }

    async fn mark_started(&self, id: TaskId, now: DateTime<Utc>) -> Result<()> {
        self.update_task(id, |t| {
            t.status = TaskStatus::Running;
            t.started_at = Some(now);
            t.updated_at = now;
        })
        .await
    }

    async fn mark_success(&self, id: TaskId, result: Value, now: DateTime<Utc>) -> Result<()> {
        self.update_task(id, |t| {
            t.status = TaskStatus::Success;
            t.result = Some(result);
            t.completed_at = Some(now);
            t.updated_at = now;
        })
        .await
    }

    async fn mark_failure(&self, id: TaskId, error: String, now: DateTime<Utc>) -> Result<()> {
        self.update_task(id, |t| {
            t.status = TaskStatus::Failure;
            t.error_message = Some(error);
            t.completed_at = Some(now);
            t.updated_at = now;
        })
        .await
    }

    async fn mark_retry(&self, id: TaskId, now: DateTime<Utc>) -> Result<()> {
        self.update_task(id, |t| {
            t.status = TaskStatus::Retry;
            t.updated_at = now;
        })
        .await
    }

    async fn mark_revoked(&self, id: TaskId, now: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("task {id}")))?;
        if !task.status.can_cancel() {
            return Err(CoreError::InvalidTransition { status: task.status, action: "cancel" });
        }
        task.status = TaskStatus::Revoked;
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(())
    }

    async fn increment_retry_count(&self, id: TaskId, now: DateTime<Utc>) -> Result<u32> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("task {id}")))?;
        task.retry_count += 1;
        task.updated_at = now;
        Ok(task.retry_count)
    }

    async fn reset_for_retry(&self, id: TaskId, now: DateTime<Utc>) -> Result<()> {
        self.update_task(id, |t| {
            t.status = TaskStatus::Queued;
            t.result = None;
            t.error_message = None;
            t.started_at = None;
            t.completed_at = None;
            t.updated_at = now;
        })
        .await
    }

    async fn record_callback_attempt(&self, id: TaskId, now: DateTime<Utc>) -> Result<()> {
        self.update_task(id, |t| {
            t.callback_attempts += 1;
            t.callback_last_attempt_at = Some(now);
            t.updated_at = now;
        })
        .await
    }

    async fn record_callback_outcome(
        &self,
        id: TaskId,
        outcome: CallbackOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.update_task(id, |t| {
            if let Some(status) = outcome.status {
                t.callback_status = status;
            }
            t.callback_last_status_code = outcome.status_code;
            t.callback_last_response_body = outcome.response_body;
            t.callback_last_error = outcome.error;
            t.updated_at = now;
        })
        .await
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn create_delivery(&self, delivery: WebhookDelivery) -> Result<()> {
        self.deliveries.write().await.insert(delivery.id, delivery);
        Ok(())
    }

    async fn find_delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>> {
        Ok(self.deliveries.read().await.get(&id).cloned())
    }

    async fn begin_attempt(&self, id: DeliveryId, now: DateTime<Utc>) -> Result<u32> {
        let mut deliveries = self.deliveries.write().await;
        let delivery = deliveries
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("delivery {id}")))?;
        delivery.attempts += 1;
        delivery.last_attempt_at = Some(now);
        Ok(delivery.attempts)
    }

    async fn record_outcome(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        response_status_code: Option<u16>,
        response_body: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        let mut deliveries = self.deliveries.write().await;
        let delivery = deliveries
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("delivery {id}")))?;
        delivery.status = status;
        delivery.response_status_code = response_status_code;
        delivery.response_body = response_body;
        delivery.error_message = error;
        Ok(())
    }

    async fn list_deliveries_for_task(&self, task_id: TaskId) -> Result<Vec<WebhookDelivery>> {
        let deliveries = self.deliveries.read().await;
        let mut matched: Vec<WebhookDelivery> = deliveries
            .values()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect();
        matched.sort_by_key(|d| Reverse(d.queued_at));
        Ok(matched)
    }
}

#[async_trait]
impl DeadLetterStore for MemoryStore {
    async fn create_entry(&self, entry: DeadLetterEntry) -> Result<()> {
        self.dead_letters.write().await.insert(entry.id, entry);
        Ok(())
    }

    async fn find_entry(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        Ok(self.dead_letters.read().await.get(&id).cloned())
    }

    async fn list_entries(&self, include_reprocessed: bool) -> Result<Vec<DeadLetterEntry>> {
        let entries = self.dead_letters.read().await;
        let mut matched: Vec<DeadLetterEntry> = entries
            .values()
            .filter(|e| include_reprocessed || !e.reprocessed)
            .cloned()
            .collect();
        matched.sort_by_key(|e| Reverse(e.created_at));
        Ok(matched)
    }

    async fn mark_reprocessed(&self, id: DeadLetterId, now: DateTime<Utc>) -> Result<()> {
        let mut entries = self.dead_letters.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("dead-letter entry {id}")))?;
        entry.reprocessed = true;
        entry.reprocessed_at = Some(now);
        Ok(())
    }
}
