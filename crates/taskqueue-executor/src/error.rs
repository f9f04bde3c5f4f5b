//! Error types for the executor crate.

use std::time::Duration;

use thiserror::Error;

use taskqueue_core::CoreError;
use taskqueue_delivery::DeliveryError;

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors surfaced by the worker pool and service facade.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic { worker_id: usize, error: String },

    /// Graceful shutdown did not finish within the timeout.
    #[error("worker shutdown timed out after {timeout_secs}s")]
    ShutdownTimeout { timeout_secs: u64 },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl ExecutorError {
    pub fn shutdown_timeout(timeout: Duration) -> Self {
        Self::ShutdownTimeout { timeout_secs: timeout.as_secs() }
    }
}
