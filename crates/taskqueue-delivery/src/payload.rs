//! Webhook payload construction and event filtering.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use taskqueue_core::{route_priority, Task};

/// Event emitted when a task finishes successfully.
pub const EVENT_SUCCEEDED: &str = "task.succeeded";
/// Event emitted when a task permanently fails.
pub const EVENT_FAILED: &str = "task.failed";
/// Event emitted when a task is revoked.
pub const EVENT_REVOKED: &str = "task.revoked";
/// Event for manual triggers on a non-terminal task.
pub const EVENT_UPDATED: &str = "task.updated";

/// Whether a delivery should be created for this task and event.
///
/// Requires a callback URL; an empty `callback_events` list subscribes to
/// everything, otherwise the event must match exactly.
pub fn should_send(task: &Task, event: &str) -> bool {
    if task.callback_url.is_none() {
        return false;
    }
    task.callback_events.is_empty() || task.callback_events.iter().any(|e| e == event)
}

/// Builds the JSON payload snapshot for an event.
///
/// The result is serialized once at enqueue time and frozen into the
/// delivery record; later task mutations never leak into the body.
pub fn build_payload(task: &Task, event: &str, sent_at: DateTime<Utc>) -> Value {
    json!({
        "event": event,
        "sent_at": sent_at,
        "task": {
            "id": task.id,
            "name": task.name,
            "task_type": task.task_type,
            "status": task.status,
            "priority": task.priority,
            "queue": route_priority(task.priority).as_str(),
            "payload": task.payload,
            "result": task.result,
            "error_message": task.error_message,
            "created_at": task.created_at,
            "started_at": task.started_at,
            "completed_at": task.completed_at,
            "tags": task.tags,
            "metadata": task.metadata,
        },
    })
}
