//! Webhook delivery pipeline.
//!
//! Builds signed, frozen webhook requests for task lifecycle events and
//! delivers them at-least-once with bounded retries. Enqueue freezes the
//! payload; the worker replays the exact bytes on every attempt.

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod payload;
pub mod retry;
pub mod signer;
pub mod worker;

pub use client::{ClientConfig, WebhookClient, WebhookResponse};
pub use error::{DeliveryError, Result};
pub use payload::{
    build_payload, should_send, EVENT_FAILED, EVENT_REVOKED, EVENT_SUCCEEDED, EVENT_UPDATED,
};
pub use retry::{apply_jitter, task_retry_delay, RetryPolicy};
pub use signer::{compute_signature, prepare_headers, timing_safe_eq};
pub use worker::{enqueue_webhook, AttemptResult, DeliveryWorker, STORED_RESPONSE_MAX_CHARS};
