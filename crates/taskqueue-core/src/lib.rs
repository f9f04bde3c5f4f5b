//! Core domain types for the task execution service.
//!
//! Provides strongly-typed models, priority routing, the job broker, the
//! clock abstraction, lifecycle notifications, and the storage contracts.
//! The delivery and executor crates build on these foundations.

#![forbid(unsafe_code)]

pub mod error;
pub mod events;
pub mod models;
pub mod queue;
pub mod routing;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    MulticastEventHandler, NoOpEventHandler, TaskEventHandler, TaskNotification, TaskSummary,
    TaskUpdate,
};
pub use models::{
    CallbackStatus, DeadLetterEntry, DeadLetterId, DeliveryId, DeliveryStatus, NewTask, Task,
    TaskId, TaskStatus, WebhookDelivery,
};
pub use queue::{Broker, Job, MemoryBroker};
pub use routing::{route_priority, QueueName};
pub use storage::{
    CallbackOutcome, DeadLetterStore, DeliveryStore, MemoryStore, TaskFilter, TaskStore,
};
pub use time::{Clock, RealClock, TestClock};
