//! In-process job broker with priority queues and delayed scheduling.
//!
//! Four named queues are consumed in strict precedence order (critical,
//! high, default, low). Delayed jobs sit in a holding area until their
//! ready time passes, then join the back of their target queue. Within a
//! queue, ordering is approximately FIFO; across queues, precedence always
//! wins.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    models::{DeliveryId, TaskId},
    routing::QueueName,
    time::Clock,
};

/// A unit of work a worker can pick up.
///
/// Task execution and webhook delivery share the queue fabric; the low
/// queue carries delivery jobs alongside low-priority tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Run the task's handler.
    ExecuteTask(TaskId),

    /// Attempt one webhook POST for a delivery record.
    ///
    /// `queue_attempt` counts broker-level redeliveries of this job, it is
    /// distinct from the record's own `attempts` counter.
    DeliverWebhook {
        delivery_id: DeliveryId,
        queue_attempt: u32,
    },
}

/// Broker contract the workers and the service poll against.
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug {
    /// Appends a job to the back of a queue.
    async fn enqueue(&self, queue: QueueName, job: Job);

    /// Pushes a job to the front of a queue (manual retries jump the line).
    async fn enqueue_front(&self, queue: QueueName, job: Job);

    /// Holds a job until `delay` has passed, then appends it to `queue`.
    async fn enqueue_delayed(&self, queue: QueueName, job: Job, delay: Duration);

    /// Pops the next eligible job, scanning queues in precedence order.
    /// Returns `None` when everything is empty or still delayed.
    async fn pop(&self) -> Option<(QueueName, Job)>;

    /// Jobs currently waiting in a queue (excludes delayed holds).
    async fn depth(&self, queue: QueueName) -> usize;
}

#[derive(Debug)]
struct DelayedJob {
    ready_at: DateTime<Utc>,
    queue: QueueName,
    job: Job,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<QueueName, VecDeque<Job>>,
    delayed: Vec<DelayedJob>,
}

impl BrokerState {
    /// Moves every due delayed job to the back of its target queue.
    fn release_due(&mut self, now: DateTime<Utc>) {
        let mut idx = 0;
        while idx < self.delayed.len() {
            if self.delayed[idx].ready_at <= now {
                let due = self.delayed.swap_remove(idx);
                self.queues.entry(due.queue).or_default().push_back(due.job);
            } else {
                idx += 1;
            }
        }
    }
}

/// Memory-backed broker used by the in-process deployment.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    clock: Arc<dyn Clock>,
}

impl MemoryBroker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(BrokerState::default()), clock }
    }

    pub fn shared(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, queue: QueueName, job: Job) {
        let mut state = self.state.lock().await;
        state.queues.entry(queue).or_default().push_back(job);
    }

    async fn enqueue_front(&self, queue: QueueName, job: Job) {
        let mut state = self.state.lock().await;
        state.queues.entry(queue).or_default().push_front(job);
    }

    async fn enqueue_delayed(&self, queue: QueueName, job: Job, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(queue, job).await;
            return;
        }
        let ready_at = self.clock.now_utc()
            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let mut state = self.state.lock().await;
        state.delayed.push(DelayedJob { ready_at, queue, job });
    }

    async fn pop(&self) -> Option<(QueueName, Job)> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;
        state.release_due(now);
        for queue in QueueName::ALL {
            if let Some(job) = state.queues.get_mut(&queue).and_then(VecDeque::pop_front) {
                return Some((queue, job));
            }
        }
        None
    }

    async fn depth(&self, queue: QueueName) -> usize {
        let state = self.state.lock().await;
        state.queues.get(&queue).map_or(0, VecDeque::len)
    }
}
