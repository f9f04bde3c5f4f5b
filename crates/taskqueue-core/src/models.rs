//! Core domain models and strongly-typed identifiers.
//!
//! Defines tasks, dead-letter entries, webhook delivery records, and newtype
//! ID wrappers for compile-time type safety. State transition logic lives in
//! the executor; this module only describes the shapes that flow through the
//! system.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Strongly-typed task identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. A task ID follows the
/// record through its entire lifecycle, including webhook payloads and
/// dead-letter entries.
///
/// # Example
///
/// ```
/// use taskqueue_core::models::TaskId;
/// let task_id = TaskId::new();
/// println!("executing task: {}", task_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Creates a new random task ID.
    ///
    /// Uses UUID v4 for globally unique identifiers without coordination.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Strongly-typed webhook delivery identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Strongly-typed dead-letter entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeadLetterId(pub Uuid);

impl DeadLetterId {
    /// Creates a new random dead-letter entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeadLetterId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Well-known priority levels.
///
/// Priority is an open integer scale; these constants name the levels the
/// router cares about. Anything in between is valid.
pub mod priority {
    pub const LOW: i32 = 1;
    pub const NORMAL: i32 = 5;
    pub const HIGH: i32 = 10;
    pub const CRITICAL: i32 = 20;
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not yet handed to the broker.
    Pending,

    /// Enqueued and waiting for a worker.
    Queued,

    /// A worker is executing the handler right now.
    Running,

    /// Terminal success state. `result` holds the handler output.
    Success,

    /// Terminal failure state after the retry budget is exhausted.
    ///
    /// A matching dead-letter entry exists for every failed task.
    Failure,

    /// Waiting out a backoff delay before the next attempt.
    Retry,

    /// Cancelled by an operator. Terminal unless manually retried.
    Revoked,
}

impl TaskStatus {
    /// True for states no automatic transition leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }

    /// True if an operator may cancel the task in this state.
    pub fn can_cancel(self) -> bool {
        matches!(self, Self::Pending | Self::Queued | Self::Running)
    }

    /// True if an operator may manually retry the task in this state.
    pub fn can_retry(self) -> bool {
        matches!(self, Self::Failure | Self::Revoked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Retry => "retry",
            Self::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// State of the webhook side-channel attached to a task.
///
/// Independent of [`TaskStatus`]: a task can succeed while its callback is
/// still pending or has permanently failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    /// No delivery has conclusively finished yet.
    Pending,

    /// At least one delivery for this task got a 2xx response.
    Success,

    /// A delivery ceiling was reached without a 2xx response.
    Failure,
}

impl fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// State of a single webhook delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, no attempt finished yet.
    Pending,

    /// The receiver answered with a 2xx. Terminal.
    Success,

    /// The most recent attempt failed. May still be retried by the queue.
    Failure,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Parameters for submitting a new task.
///
/// Everything except `name` and `task_type` has a sensible default, so
/// callers use struct-update syntax against [`NewTask::default`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub name: String,
    pub task_type: String,
    pub payload: Map<String, Value>,
    /// Priority on the open integer scale; see [`priority`].
    pub priority: Option<i32>,
    /// Run no earlier than this instant. `None` means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<u32>,
    pub callback_url: Option<String>,
    pub callback_secret: Option<String>,
    /// Event filter. Empty means all events are delivered.
    pub callback_events: Vec<String>,
    /// Extra headers merged over the computed set at enqueue time.
    pub callback_headers: Map<String, Value>,
    pub callback_max_attempts: Option<u32>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// A unit of work flowing through the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Handler registry key, e.g. `"echo"` or `"http_request"`.
    pub task_type: String,
    pub payload: Map<String, Value>,
    pub status: TaskStatus,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,

    // retry accounting
    pub max_retries: u32,
    /// Base delay in seconds; actual delay grows linearly with the attempt
    /// number.
    pub retry_delay_secs: u32,
    pub retry_count: u32,

    // outcome
    pub result: Option<Value>,
    pub error_message: Option<String>,

    // webhook configuration
    pub callback_url: Option<String>,
    pub callback_secret: Option<String>,
    pub callback_events: Vec<String>,
    pub callback_headers: Map<String, Value>,
    pub callback_max_attempts: u32,
    pub callback_status: CallbackStatus,
    pub callback_attempts: u32,
    pub callback_last_attempt_at: Option<DateTime<Utc>>,
    pub callback_last_status_code: Option<u16>,
    pub callback_last_response_body: Option<String>,
    pub callback_last_error: Option<String>,

    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u32 = 60;
pub const DEFAULT_CALLBACK_MAX_ATTEMPTS: u32 = 5;

impl Task {
    /// Builds a pending task record from submission parameters.
    pub fn create(params: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            name: params.name,
            task_type: params.task_type,
            payload: params.payload,
            status: TaskStatus::Pending,
            priority: params.priority.unwrap_or(priority::NORMAL),
            scheduled_at: params.scheduled_at,
            max_retries: params.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_secs: params.retry_delay_secs.unwrap_or(DEFAULT_RETRY_DELAY_SECS),
            retry_count: 0,
            result: None,
            error_message: None,
            callback_url: params.callback_url,
            callback_secret: params.callback_secret,
            callback_events: params.callback_events,
            callback_headers: params.callback_headers,
            callback_max_attempts: params
                .callback_max_attempts
                .unwrap_or(DEFAULT_CALLBACK_MAX_ATTEMPTS),
            callback_status: CallbackStatus::Pending,
            callback_attempts: 0,
            callback_last_attempt_at: None,
            callback_last_status_code: None,
            callback_last_response_body: None,
            callback_last_error: None,
            tags: params.tags,
            metadata: params.metadata,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Duration of the last run, if the task both started and completed.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// Audit record created exactly once when a task permanently fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub task_id: TaskId,
    pub task_name: String,
    pub task_type: String,
    /// Snapshot of the payload at failure time.
    pub payload: Map<String, Value>,
    pub error_message: String,
    /// Expanded failure context (handler error plus attempt history).
    pub error_detail: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub reprocessed: bool,
    pub reprocessed_at: Option<DateTime<Utc>>,
}

/// Immutable record of one webhook delivery and its frozen request.
///
/// The URL, headers, body, and signature are captured when the delivery is
/// enqueued and never recomputed, so every attempt (and any replay) sends
/// byte-identical content even if the task record changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub task_id: TaskId,
    /// Event name, e.g. `"task.succeeded"`.
    pub event: String,
    pub status: DeliveryStatus,
    /// Completed POST attempts against this record.
    pub attempts: u32,

    // frozen request
    pub request_url: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: String,
    pub signature: Option<String>,

    pub queued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub response_status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,

    /// Set on replay records: the delivery this one was cloned from.
    pub replay_of: Option<DeliveryId>,
}
