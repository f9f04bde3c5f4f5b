//! Task execution engine.
//!
//! Resolves task types against a static handler registry, runs attempts on
//! a polling worker pool with retry/dead-letter semantics, and exposes the
//! operator-facing service facade.

#![forbid(unsafe_code)]

pub mod error;
pub mod executor;
pub mod handlers;
pub mod service;
pub mod worker_pool;

pub use error::{ExecutorError, Result};
pub use executor::{AttemptOutcome, ExecutionResult, RevocationRegistry, TaskExecutor};
pub use handlers::{HandlerError, HandlerRegistry, HandlerResult, TaskHandler};
pub use service::{ServiceStats, TaskService};
pub use worker_pool::{EngineStats, PoolConfig, WorkerPool};
