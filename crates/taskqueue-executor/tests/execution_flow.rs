//! Integration tests for the execution state machine and service facade.
//!
//! Jobs are pumped by hand (pop then execute) for deterministic control
//! over ordering and virtual time.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use taskqueue_core::{
    queue::Job, Broker, Clock, CoreError, DeadLetterStore, DeliveryStore, MemoryBroker, MemoryStore,
    NewTask, QueueName, TaskEventHandler, TaskNotification, TaskStatus, TestClock,
};
use taskqueue_delivery::{ClientConfig, DeliveryWorker, RetryPolicy, WebhookClient};
use taskqueue_executor::{
    ExecutionResult, HandlerError, HandlerRegistry, RevocationRegistry, TaskExecutor, TaskHandler,
    TaskService,
};

/// Handler that always fails with a fixed message.
#[derive(Debug)]
struct AlwaysFailHandler;

#[async_trait]
impl TaskHandler for AlwaysFailHandler {
    async fn run(&self, _payload: &Map<String, Value>) -> Result<Value, HandlerError> {
        Err(HandlerError::new("induced failure"))
    }
}

/// Handler that blocks until externally cancelled.
#[derive(Debug)]
struct HangingHandler;

#[async_trait]
impl TaskHandler for HangingHandler {
    async fn run(&self, _payload: &Map<String, Value>) -> Result<Value, HandlerError> {
        // far beyond any test duration; revocation interrupts the select
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!({}))
    }
}

#[derive(Debug, Default)]
struct RecordingHandler {
    seen: Mutex<Vec<TaskNotification>>,
}

#[async_trait]
impl TaskEventHandler for RecordingHandler {
    async fn handle_notification(&self, notification: TaskNotification) {
        self.seen.lock().unwrap().push(notification);
    }
}

struct Env {
    store: Arc<MemoryStore>,
    broker: Arc<MemoryBroker>,
    clock: Arc<TestClock>,
    executor: Arc<TaskExecutor>,
    service: TaskService,
    notifications: Arc<RecordingHandler>,
}

fn env() -> Env {
    let clock: Arc<TestClock> = Arc::new(TestClock::new());
    let store = MemoryStore::shared();
    let broker = MemoryBroker::shared(clock.clone());
    let notifications = Arc::new(RecordingHandler::default());

    let mut registry = HandlerRegistry::builtin(clock.clone());
    registry.register("always_fail", Arc::new(AlwaysFailHandler));
    registry.register("hang", Arc::new(HangingHandler));
    let registry = Arc::new(registry);

    let revocations = Arc::new(RevocationRegistry::new());
    let delivery_worker = Arc::new(DeliveryWorker::new(
        store.clone(),
        store.clone(),
        broker.clone(),
        WebhookClient::new(ClientConfig::default()).unwrap(),
        RetryPolicy::default(),
        clock.clone(),
    ));
    let executor = Arc::new(TaskExecutor::new(
        store.clone(),
        store.clone(),
        store.clone(),
        broker.clone(),
        registry,
        notifications.clone(),
        revocations.clone(),
        clock.clone(),
    ));
    let service = TaskService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        broker.clone(),
        delivery_worker,
        notifications.clone(),
        revocations,
        clock.clone(),
    );

    Env { store, broker, clock, executor, service, notifications }
}

fn params(task_type: &str) -> NewTask {
    NewTask {
        name: format!("{task_type} job"),
        task_type: task_type.into(),
        retry_delay_secs: Some(0),
        ..Default::default()
    }
}

async fn pump(env: &Env) -> Option<(QueueName, ExecutionResult)> {
    let (queue, job) = env.broker.pop().await?;
    match job {
        Job::ExecuteTask(id) => Some((queue, env.executor.execute(id).await.unwrap())),
        Job::DeliverWebhook { .. } => panic!("unexpected delivery job"),
    }
}

#[tokio::test]
async fn submission_routes_by_priority() {
    let env = env();
    let critical = env
        .service
        .submit(NewTask { priority: Some(25), ..params("echo") })
        .await
        .unwrap();
    let high = env
        .service
        .submit(NewTask { priority: Some(10), ..params("echo") })
        .await
        .unwrap();
    let normal = env.service.submit(params("echo")).await.unwrap();
    let low = env
        .service
        .submit(NewTask { priority: Some(0), ..params("echo") })
        .await
        .unwrap();

    // consumption follows queue precedence regardless of submission order
    let order: Vec<(QueueName, Job)> = [
        env.broker.pop().await.unwrap(),
        env.broker.pop().await.unwrap(),
        env.broker.pop().await.unwrap(),
        env.broker.pop().await.unwrap(),
    ]
    .into();
    assert_eq!(order[0], (QueueName::Critical, Job::ExecuteTask(critical)));
    assert_eq!(order[1], (QueueName::High, Job::ExecuteTask(high)));
    assert_eq!(order[2], (QueueName::Default, Job::ExecuteTask(normal)));
    assert_eq!(order[3], (QueueName::Low, Job::ExecuteTask(low)));

    for id in [critical, high, normal, low] {
        assert_eq!(env.service.get_task(id).await.unwrap().status, TaskStatus::Queued);
    }
}

#[tokio::test]
async fn successful_execution_records_result_and_timestamps() {
    let env = env();
    let task_id = env
        .service
        .submit(NewTask {
            payload: serde_json::from_value(json!({"key": "value"})).unwrap(),
            ..params("echo")
        })
        .await
        .unwrap();

    let (_, result) = pump(&env).await.unwrap();
    assert_eq!(result, ExecutionResult::Succeeded);

    let task = env.service.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.result, Some(json!({"echoed": {"key": "value"}})));
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());
    assert!(task.error_message.is_none());

    // created + running + success notifications were emitted
    let seen = env.notifications.seen.lock().unwrap();
    assert!(seen.iter().any(|n| matches!(n, TaskNotification::Created(_))));
    assert!(seen.iter().any(
        |n| matches!(n, TaskNotification::Updated(u) if u.status == TaskStatus::Running)
    ));
    assert!(seen.iter().any(
        |n| matches!(n, TaskNotification::Updated(u) if u.status == TaskStatus::Success)
    ));
}

#[tokio::test]
async fn unknown_task_type_burns_retry_budget_then_dead_letters() {
    let env = env();
    let task_id = env
        .service
        .submit(NewTask { max_retries: Some(2), ..params("no_such_type") })
        .await
        .unwrap();

    let (_, result) = pump(&env).await.unwrap();
    assert_eq!(result, ExecutionResult::RetryScheduled);
    let task = env.service.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Retry);
    assert_eq!(task.retry_count, 1);

    // zero retry delay makes the redelivery immediately visible
    let (_, result) = pump(&env).await.unwrap();
    assert_eq!(result, ExecutionResult::DeadLettered);

    let task = env.service.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.retry_count, 2);
    assert!(task.error_message.as_deref().unwrap().contains("unknown task type"));

    let entries = env.store.list_entries(true).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task_id, task_id);
    assert_eq!(entries[0].retry_count, 2);
    assert!(entries[0].error_detail.contains("no_such_type"));
}

#[tokio::test]
async fn retry_backoff_grows_linearly() {
    let env = env();
    env.service
        .submit(NewTask {
            max_retries: Some(3),
            retry_delay_secs: Some(10),
            ..params("always_fail")
        })
        .await
        .unwrap();

    let (_, result) = pump(&env).await.unwrap();
    assert_eq!(result, ExecutionResult::RetryScheduled);

    // first retry waits retry_delay * 1 (±25% jitter): hidden at 7s
    env.clock.advance(Duration::from_secs(7));
    assert!(env.broker.pop().await.is_none());
    env.clock.advance(Duration::from_secs(6));
    let (_, result) = pump(&env).await.unwrap();
    assert_eq!(result, ExecutionResult::RetryScheduled);

    // second retry waits retry_delay * 2 (±25%): hidden at 14s
    env.clock.advance(Duration::from_secs(14));
    assert!(env.broker.pop().await.is_none());
    env.clock.advance(Duration::from_secs(12));
    let (_, result) = pump(&env).await.unwrap();
    assert_eq!(result, ExecutionResult::DeadLettered);
}

#[tokio::test]
async fn cancel_queued_task_makes_job_stale() {
    let env = env();
    let task_id = env.service.submit(params("echo")).await.unwrap();
    env.service.cancel(task_id).await.unwrap();

    let task = env.service.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Revoked);

    // the queued job is still in the broker but must not run the handler
    let (_, result) = pump(&env).await.unwrap();
    assert_eq!(result, ExecutionResult::Skipped);
    assert_eq!(env.service.get_task(task_id).await.unwrap().status, TaskStatus::Revoked);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_running_task_interrupts_the_attempt() {
    let env = env();
    let task_id = env.service.submit(params("hang")).await.unwrap();

    let (_, job) = env.broker.pop().await.unwrap();
    assert_eq!(job, Job::ExecuteTask(task_id));
    let executor = env.executor.clone();
    let handle = tokio::spawn(async move { executor.execute(task_id).await });

    // wait for the attempt to reach running
    for _ in 0..200 {
        if env.service.get_task(task_id).await.unwrap().status == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(env.service.get_task(task_id).await.unwrap().status, TaskStatus::Running);

    env.service.cancel(task_id).await.unwrap();
    let result = handle.await.unwrap().unwrap();
    assert_eq!(result, ExecutionResult::Revoked);
    assert_eq!(env.service.get_task(task_id).await.unwrap().status, TaskStatus::Revoked);
}

#[tokio::test]
async fn cancel_terminal_task_is_rejected() {
    let env = env();
    let task_id = env.service.submit(params("echo")).await.unwrap();
    pump(&env).await.unwrap();

    let err = env.service.cancel(task_id).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::InvalidTransition { status: TaskStatus::Success, action: "cancel" }
    ));
}

#[tokio::test]
async fn manual_retry_requeues_at_the_front() {
    let env = env();
    let failed = env
        .service
        .submit(NewTask { max_retries: Some(1), ..params("always_fail") })
        .await
        .unwrap();
    let (_, result) = pump(&env).await.unwrap();
    assert_eq!(result, ExecutionResult::DeadLettered);

    // another task waits in the same queue
    let other = env.service.submit(params("echo")).await.unwrap();

    env.service.retry(failed).await.unwrap();
    let task = env.service.get_task(failed).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.error_message.is_none());
    // cumulative history survives a manual retry
    assert_eq!(task.retry_count, 1);

    let (_, job) = env.broker.pop().await.unwrap();
    assert_eq!(job, Job::ExecuteTask(failed));
    let (_, job) = env.broker.pop().await.unwrap();
    assert_eq!(job, Job::ExecuteTask(other));
}

#[tokio::test]
async fn retry_of_non_terminal_task_is_rejected() {
    let env = env();
    let task_id = env.service.submit(params("echo")).await.unwrap();
    let err = env.service.retry(task_id).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { action: "retry", .. }));
}

#[tokio::test]
async fn scheduled_task_stays_hidden_until_due() {
    let env = env();
    let run_at = env.clock.now_utc() + chrono::Duration::seconds(120);
    env.service
        .submit(NewTask { scheduled_at: Some(run_at), ..params("echo") })
        .await
        .unwrap();

    assert!(env.broker.pop().await.is_none());
    env.clock.advance(Duration::from_secs(119));
    assert!(env.broker.pop().await.is_none());
    env.clock.advance(Duration::from_secs(1));
    let (_, result) = pump(&env).await.unwrap();
    assert_eq!(result, ExecutionResult::Succeeded);
}

#[tokio::test]
async fn terminal_failure_enqueues_failed_webhook() {
    let env = env();
    let task_id = env
        .service
        .submit(NewTask {
            max_retries: Some(1),
            callback_url: Some("https://example.com/hook".into()),
            ..params("always_fail")
        })
        .await
        .unwrap();

    pump(&env).await.unwrap();

    let deliveries = env.store.list_deliveries_for_task(task_id).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].event, "task.failed");
    // the frozen snapshot carries the post-transition state
    let body: Value = serde_json::from_str(&deliveries[0].request_body).unwrap();
    assert_eq!(body["task"]["status"], "failure");

    let (queue, job) = env.broker.pop().await.unwrap();
    assert_eq!(queue, QueueName::Low);
    assert!(matches!(job, Job::DeliverWebhook { queue_attempt: 1, .. }));
}

#[tokio::test]
async fn trigger_webhook_derives_event_from_status() {
    let env = env();
    let task_id = env
        .service
        .submit(NewTask {
            callback_url: Some("https://example.com/hook".into()),
            ..params("echo")
        })
        .await
        .unwrap();
    pump(&env).await.unwrap();
    // drop the automatic success delivery job
    env.broker.pop().await.unwrap();

    let (event, delivery_id) = env.service.trigger_webhook(task_id, None).await.unwrap();
    assert_eq!(event, "task.succeeded");
    assert!(delivery_id.is_some());

    let (event, delivery_id) = env
        .service
        .trigger_webhook(task_id, Some("task.updated".into()))
        .await
        .unwrap();
    assert_eq!(event, "task.updated");
    // empty filter subscribes to everything
    assert!(delivery_id.is_some());
}

#[tokio::test]
async fn trigger_webhook_without_callback_is_suppressed() {
    let env = env();
    let task_id = env.service.submit(params("echo")).await.unwrap();
    pump(&env).await.unwrap();

    let (event, delivery_id) = env.service.trigger_webhook(task_id, None).await.unwrap();
    assert_eq!(event, "task.succeeded");
    assert!(delivery_id.is_none());
}

#[tokio::test]
async fn reprocessing_dead_letters_creates_a_fresh_task() {
    let env = env();
    let original = env
        .service
        .submit(NewTask {
            max_retries: Some(1),
            payload: serde_json::from_value(json!({"n": 1})).unwrap(),
            ..params("always_fail")
        })
        .await
        .unwrap();
    pump(&env).await.unwrap();

    let entry = env.service.list_dead_letters(false).await.unwrap().remove(0);
    let reprocessed = env.service.reprocess_dead_letter(entry.id).await.unwrap();
    assert_ne!(reprocessed, original);

    let task = env.service.get_task(reprocessed).await.unwrap();
    assert_eq!(task.name, "[Reprocessed] always_fail job");
    assert_eq!(task.task_type, "always_fail");
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.payload.get("n"), Some(&json!(1)));

    // entries reprocess exactly once
    let err = env.service.reprocess_dead_letter(entry.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    assert!(env.service.list_dead_letters(false).await.unwrap().is_empty());
}

#[tokio::test]
async fn stats_aggregate_statuses_and_queues() {
    let env = env();
    env.service.submit(params("echo")).await.unwrap();
    pump(&env).await.unwrap();
    env.service
        .submit(NewTask { priority: Some(25), ..params("echo") })
        .await
        .unwrap();

    let stats = env.service.stats().await.unwrap();
    assert_eq!(stats.total_tasks, 2);
    assert_eq!(stats.by_status.get("success"), Some(&1));
    assert_eq!(stats.by_status.get("queued"), Some(&1));
    assert_eq!(stats.queue_depths.get("critical"), Some(&1));
    assert_eq!(stats.dead_letters, 0);
    assert!(stats.avg_duration_secs.is_some());
}
