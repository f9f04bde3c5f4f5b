//! Webhook enqueue and delivery processing.
//!
//! `enqueue_webhook` freezes the request (payload, headers, signature) into
//! a delivery record and hands a job to the low queue. `DeliveryWorker`
//! executes those jobs: one POST per call, with outcome recording on both
//! the delivery record and the owning task, and broker-level redelivery on
//! retryable failures.
//!
//! Two ceilings bound the retries: the task's `callback_max_attempts`
//! (completed POSTs against the record) and the broker policy's
//! `max_attempts` (queue redeliveries). Whichever is reached first ends the
//! delivery and marks the task's callback as failed.

use std::sync::Arc;

use tracing::{info, warn};

use taskqueue_core::{
    queue::{Broker, Job},
    storage::CallbackOutcome,
    CallbackStatus, Clock, CoreError, DeliveryId, DeliveryStatus, DeliveryStore, QueueName, Task,
    TaskStore, WebhookDelivery,
};

use crate::{
    client::WebhookClient,
    error::{DeliveryError, Result},
    payload::{build_payload, should_send},
    retry::RetryPolicy,
    signer::{compute_signature, prepare_headers},
};

/// Stored response bodies are cut to this many characters.
pub const STORED_RESPONSE_MAX_CHARS: usize = 4000;

/// Creates a frozen delivery record and enqueues its first attempt.
///
/// Returns `Ok(None)` when the task has no callback URL or the event does
/// not pass its filter. Call this only after the state transition that
/// produced `event` has been persisted; the payload snapshots the task as
/// passed in.
pub async fn enqueue_webhook(
    task: &Task,
    event: &str,
    deliveries: &dyn DeliveryStore,
    broker: &dyn Broker,
    clock: &dyn Clock,
) -> Result<Option<DeliveryId>> {
    if !should_send(task, event) {
        return Ok(None);
    }
    let Some(url) = task.callback_url.clone() else {
        return Ok(None);
    };

    let now = clock.now_utc();
    let payload = build_payload(task, event, now);
    let body = payload.to_string();
    let signature = match task.callback_secret.as_deref() {
        Some(secret) => Some(compute_signature(secret, body.as_bytes())?),
        None => None,
    };
    let headers = prepare_headers(task, event, signature.as_deref());

    let delivery = WebhookDelivery {
        id: DeliveryId::new(),
        task_id: task.id,
        event: event.to_owned(),
        status: DeliveryStatus::Pending,
        attempts: 0,
        request_url: url,
        request_headers: headers,
        request_body: body,
        signature,
        queued_at: now,
        last_attempt_at: None,
        response_status_code: None,
        response_body: None,
        error_message: None,
        replay_of: None,
    };
    let delivery_id = delivery.id;
    deliveries.create_delivery(delivery).await?;

    broker
        .enqueue(QueueName::Low, Job::DeliverWebhook { delivery_id, queue_attempt: 1 })
        .await;

    info!(
        delivery_id = %delivery_id,
        task_id = %task.id,
        event = %event,
        "webhook delivery enqueued"
    );
    Ok(Some(delivery_id))
}

/// Result of processing one delivery job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    /// The receiver acknowledged with a 2xx.
    Delivered,

    /// The attempt failed; a redelivery job was scheduled.
    RetryScheduled { next_queue_attempt: u32 },

    /// A retry ceiling was reached; the callback is terminally failed.
    Exhausted,

    /// Nothing to do (record gone, already delivered, or task deleted).
    Skipped,
}

/// Executes delivery jobs popped from the broker.
#[derive(Debug)]
pub struct DeliveryWorker {
    tasks: Arc<dyn TaskStore>,
    deliveries: Arc<dyn DeliveryStore>,
    broker: Arc<dyn Broker>,
    client: WebhookClient,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        deliveries: Arc<dyn DeliveryStore>,
        broker: Arc<dyn Broker>,
        client: WebhookClient,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { tasks, deliveries, broker, client, policy, clock }
    }

    /// Runs one POST for a delivery record and records the outcome.
    ///
    /// `queue_attempt` is the 1-based number of this broker job for the
    /// record; redeliveries carry the incremented value.
    pub async fn process(
        &self,
        delivery_id: DeliveryId,
        queue_attempt: u32,
    ) -> Result<AttemptResult> {
        let Some(delivery) = self.deliveries.find_delivery(delivery_id).await? else {
            warn!(delivery_id = %delivery_id, "delivery record missing, dropping job");
            return Ok(AttemptResult::Skipped);
        };
        if delivery.status == DeliveryStatus::Success {
            return Ok(AttemptResult::Skipped);
        }
        let Some(task) = self.tasks.find_task(delivery.task_id).await? else {
            warn!(
                delivery_id = %delivery_id,
                task_id = %delivery.task_id,
                "task missing for delivery, dropping job"
            );
            return Ok(AttemptResult::Skipped);
        };

        // record-level ceiling checked before spending another POST
        if delivery.attempts >= task.callback_max_attempts {
            let message = DeliveryError::AttemptsExhausted { attempts: delivery.attempts }
                .to_string();
            self.deliveries
                .record_outcome(
                    delivery_id,
                    DeliveryStatus::Failure,
                    delivery.response_status_code,
                    delivery.response_body.clone(),
                    Some(message.clone()),
                )
                .await?;
            self.tasks
                .record_callback_outcome(
                    task.id,
                    CallbackOutcome {
                        status: Some(CallbackStatus::Failure),
                        status_code: task.callback_last_status_code,
                        response_body: task.callback_last_response_body.clone(),
                        error: Some(message),
                    },
                    self.clock.now_utc(),
                )
                .await?;
            warn!(
                delivery_id = %delivery_id,
                task_id = %task.id,
                attempts = delivery.attempts,
                "delivery abandoned, callback attempts exhausted"
            );
            return Ok(AttemptResult::Exhausted);
        }

        let now = self.clock.now_utc();
        let attempt = self.deliveries.begin_attempt(delivery_id, now).await?;
        self.tasks.record_callback_attempt(task.id, now).await?;

        let outcome = self
            .client
            .post(&delivery.request_url, &delivery.request_headers, &delivery.request_body)
            .await;

        match outcome {
            Ok(response) if response.is_success() => {
                let body = truncate_chars(&response.body, STORED_RESPONSE_MAX_CHARS);
                self.deliveries
                    .record_outcome(
                        delivery_id,
                        DeliveryStatus::Success,
                        Some(response.status_code),
                        Some(body.clone()),
                        None,
                    )
                    .await?;
                self.tasks
                    .record_callback_outcome(
                        task.id,
                        CallbackOutcome {
                            status: Some(CallbackStatus::Success),
                            status_code: Some(response.status_code),
                            response_body: Some(body),
                            error: None,
                        },
                        self.clock.now_utc(),
                    )
                    .await?;
                info!(
                    delivery_id = %delivery_id,
                    task_id = %task.id,
                    event = %delivery.event,
                    status = response.status_code,
                    attempt,
                    "webhook delivered"
                );
                Ok(AttemptResult::Delivered)
            }
            Ok(response) => {
                let error = DeliveryError::http_status(response.status_code);
                let body = truncate_chars(&response.body, STORED_RESPONSE_MAX_CHARS);
                self.finish_failed_attempt(
                    &delivery,
                    &task,
                    queue_attempt,
                    attempt,
                    Some(response.status_code),
                    Some(body),
                    error,
                )
                .await
            }
            Err(error) => {
                self.finish_failed_attempt(
                    &delivery, &task, queue_attempt, attempt, None, None, error,
                )
                .await
            }
        }
    }

    /// Records a failed attempt and schedules redelivery if a retry budget
    /// remains on both ceilings.
    #[allow(clippy::too_many_arguments)]
    async fn finish_failed_attempt(
        &self,
        delivery: &WebhookDelivery,
        task: &Task,
        queue_attempt: u32,
        record_attempt: u32,
        status_code: Option<u16>,
        response_body: Option<String>,
        error: DeliveryError,
    ) -> Result<AttemptResult> {
        let message = error.to_string();
        self.deliveries
            .record_outcome(
                delivery.id,
                DeliveryStatus::Failure,
                status_code,
                response_body.clone(),
                Some(message.clone()),
            )
            .await?;

        let next_queue_attempt = queue_attempt + 1;
        let record_exhausted = record_attempt >= task.callback_max_attempts;
        let queue_delay = self.policy.delay_before(next_queue_attempt);
        let terminal = record_exhausted || queue_delay.is_none();

        self.tasks
            .record_callback_outcome(
                task.id,
                CallbackOutcome {
                    status: terminal.then_some(CallbackStatus::Failure),
                    status_code,
                    response_body,
                    error: Some(message.clone()),
                },
                self.clock.now_utc(),
            )
            .await?;

        if terminal {
            warn!(
                delivery_id = %delivery.id,
                task_id = %task.id,
                event = %delivery.event,
                error = %message,
                record_attempt,
                queue_attempt,
                "webhook delivery failed terminally"
            );
            return Ok(AttemptResult::Exhausted);
        }

        // both ceilings still have room; queue_delay is Some here
        let delay = queue_delay.unwrap_or_default();
        self.broker
            .enqueue_delayed(
                QueueName::Low,
                Job::DeliverWebhook {
                    delivery_id: delivery.id,
                    queue_attempt: next_queue_attempt,
                },
                delay,
            )
            .await;
        info!(
            delivery_id = %delivery.id,
            task_id = %task.id,
            error = %message,
            next_queue_attempt,
            delay_secs = delay.as_secs(),
            "webhook delivery failed, retry scheduled"
        );
        Ok(AttemptResult::RetryScheduled { next_queue_attempt })
    }

    /// Clones a delivery's frozen request into a fresh record and enqueues
    /// it. The replay starts its own attempt budget and points back at the
    /// original via `replay_of`.
    pub async fn replay(&self, delivery_id: DeliveryId) -> Result<DeliveryId> {
        let Some(original) = self.deliveries.find_delivery(delivery_id).await? else {
            return Err(CoreError::not_found(format!("delivery {delivery_id}")).into());
        };

        let replayed = WebhookDelivery {
            id: DeliveryId::new(),
            task_id: original.task_id,
            event: original.event.clone(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            request_url: original.request_url.clone(),
            request_headers: original.request_headers.clone(),
            request_body: original.request_body.clone(),
            signature: original.signature.clone(),
            queued_at: self.clock.now_utc(),
            last_attempt_at: None,
            response_status_code: None,
            response_body: None,
            error_message: None,
            replay_of: Some(original.id),
        };
        let replay_id = replayed.id;
        self.deliveries.create_delivery(replayed).await?;
        self.broker
            .enqueue(
                QueueName::Low,
                Job::DeliverWebhook { delivery_id: replay_id, queue_attempt: 1 },
            )
            .await;

        info!(
            delivery_id = %replay_id,
            replay_of = %delivery_id,
            task_id = %original.task_id,
            event = %original.event,
            "webhook delivery replayed"
        );
        Ok(replay_id)
    }
}

/// Truncates to `max_chars` characters (not bytes).
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    text.chars().take(max_chars).collect()
}
