//! Notification events for decoupled downstream consumers.
//!
//! The executor emits lifecycle notifications (task created, status changed)
//! without knowing who listens. Consumers implement [`TaskEventHandler`];
//! dispatch is fire-and-forget and never influences execution outcomes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{TaskId, TaskStatus};

/// Lifecycle notifications emitted by the task service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskNotification {
    /// A new task record was persisted.
    Created(TaskSummary),

    /// A task changed status.
    Updated(TaskUpdate),
}

/// Compact task description sent with creation notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub name: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// Status-change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error_message: Option<String>,
}

/// Trait for receiving task lifecycle notifications.
///
/// Implementations must not block execution; failures are logged by the
/// implementation and never propagated back to the worker.
#[async_trait::async_trait]
pub trait TaskEventHandler: Send + Sync + std::fmt::Debug {
    async fn handle_notification(&self, notification: TaskNotification);
}

/// Handler that discards all notifications.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl TaskEventHandler for NoOpEventHandler {
    async fn handle_notification(&self, _notification: TaskNotification) {}
}

/// Forwards each notification to every subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn TaskEventHandler>>,
}

impl MulticastEventHandler {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn add_subscriber(&mut self, handler: Arc<dyn TaskEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl TaskEventHandler for MulticastEventHandler {
    async fn handle_notification(&self, notification: TaskNotification) {
        let futures = self.handlers.iter().map(|handler| {
            let notification = notification.clone();
            async move {
                handler.handle_notification(notification).await;
            }
        });

        // Subscriber failures never reach the executor.
        futures::future::join_all(futures).await;
    }
}
