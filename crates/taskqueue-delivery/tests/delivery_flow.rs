//! End-to-end tests for the webhook delivery pipeline against a live mock
//! receiver.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use taskqueue_core::{
    queue::Job, Broker, CallbackStatus, Clock, DeliveryStatus, DeliveryStore, MemoryBroker,
    MemoryStore,
    NewTask, QueueName, Task, TaskStore, TestClock,
};
use taskqueue_delivery::{
    compute_signature, enqueue_webhook, timing_safe_eq, AttemptResult, ClientConfig,
    DeliveryWorker, RetryPolicy, WebhookClient, EVENT_SUCCEEDED,
};

struct Env {
    store: Arc<MemoryStore>,
    broker: Arc<MemoryBroker>,
    clock: Arc<TestClock>,
    worker: DeliveryWorker,
}

fn env_with_policy(policy: RetryPolicy) -> Env {
    let clock = Arc::new(TestClock::new());
    let store = MemoryStore::shared();
    let broker = MemoryBroker::shared(clock.clone());
    let client = WebhookClient::new(ClientConfig::default()).unwrap();
    let worker = DeliveryWorker::new(
        store.clone(),
        store.clone(),
        broker.clone(),
        client,
        policy,
        clock.clone(),
    );
    Env { store, broker, clock, worker }
}

fn env() -> Env {
    env_with_policy(RetryPolicy {
        base_delay: Duration::from_secs(1),
        jitter_factor: 0.0,
        ..Default::default()
    })
}

async fn submit_task(env: &Env, callback_url: &str, params: NewTask) -> Task {
    let task = Task::create(
        NewTask { callback_url: Some(callback_url.to_owned()), ..params },
        env.clock.now_utc(),
    );
    env.store.create_task(task.clone()).await.unwrap();
    task
}

fn base_params() -> NewTask {
    NewTask {
        name: "sync accounts".into(),
        task_type: "echo".into(),
        payload: serde_json::from_value(json!({"key": "value"})).unwrap(),
        callback_secret: Some("shhh".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn successful_delivery_marks_record_and_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let env = env();
    let task = submit_task(&env, &format!("{}/hook", server.uri()), base_params()).await;

    let delivery_id =
        enqueue_webhook(&task, EVENT_SUCCEEDED, env.store.as_ref(), env.broker.as_ref(), env.clock.as_ref())
            .await
            .unwrap()
            .expect("delivery should be created");

    // the job landed on the low queue
    let (queue, job) = env.broker.pop().await.unwrap();
    assert_eq!(queue, QueueName::Low);
    assert_eq!(job, Job::DeliverWebhook { delivery_id, queue_attempt: 1 });

    let result = env.worker.process(delivery_id, 1).await.unwrap();
    assert_eq!(result, AttemptResult::Delivered);

    let delivery = env.store.find_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempts, 1);
    assert_eq!(delivery.response_status_code, Some(200));
    assert_eq!(delivery.response_body.as_deref(), Some("ok"));

    let task = env.store.find_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.callback_status, CallbackStatus::Success);
    assert_eq!(task.callback_attempts, 1);
    assert_eq!(task.callback_last_status_code, Some(200));
}

#[tokio::test]
async fn signature_covers_frozen_body() {
    let server = MockServer::start().await;
    let env = env();
    let task = submit_task(&env, &format!("{}/hook", server.uri()), base_params()).await;

    let delivery_id =
        enqueue_webhook(&task, EVENT_SUCCEEDED, env.store.as_ref(), env.broker.as_ref(), env.clock.as_ref())
            .await
            .unwrap()
            .unwrap();
    let delivery = env.store.find_delivery(delivery_id).await.unwrap().unwrap();

    // a receiver holding the shared secret can verify the body
    let expected = compute_signature("shhh", delivery.request_body.as_bytes()).unwrap();
    let sent = delivery.signature.as_deref().unwrap();
    assert!(timing_safe_eq(sent, &expected));
    assert!(delivery
        .request_headers
        .iter()
        .any(|(n, v)| n == "X-Taskqueue-Signature" && v == sent));

    // payload snapshots the task
    let body: serde_json::Value = serde_json::from_str(&delivery.request_body).unwrap();
    assert_eq!(body["event"], EVENT_SUCCEEDED);
    assert_eq!(body["task"]["id"], task.id.to_string());
    assert_eq!(body["task"]["payload"]["key"], "value");
}

#[tokio::test]
async fn event_filter_suppresses_delivery() {
    let env = env();
    let task = submit_task(
        &env,
        "https://example.com/hook",
        NewTask { callback_events: vec!["task.failed".into()], ..base_params() },
    )
    .await;

    let created =
        enqueue_webhook(&task, EVENT_SUCCEEDED, env.store.as_ref(), env.broker.as_ref(), env.clock.as_ref())
            .await
            .unwrap();
    assert!(created.is_none());
    assert!(env.broker.pop().await.is_none());
    assert!(env.store.list_deliveries_for_task(task.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_attempt_records_state_and_schedules_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let env = env();
    let task = submit_task(&env, &server.uri(), base_params()).await;
    let delivery_id =
        enqueue_webhook(&task, EVENT_SUCCEEDED, env.store.as_ref(), env.broker.as_ref(), env.clock.as_ref())
            .await
            .unwrap()
            .unwrap();
    env.broker.pop().await.unwrap();

    let result = env.worker.process(delivery_id, 1).await.unwrap();
    assert_eq!(result, AttemptResult::RetryScheduled { next_queue_attempt: 2 });

    let delivery = env.store.find_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failure);
    assert_eq!(delivery.attempts, 1);
    assert_eq!(delivery.response_status_code, Some(500));
    assert_eq!(delivery.response_body.as_deref(), Some("boom"));
    assert!(delivery.error_message.as_deref().unwrap().contains("500"));

    // the task keeps a pending callback while retries remain
    let task = env.store.find_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.callback_status, CallbackStatus::Pending);
    assert_eq!(task.callback_attempts, 1);
    assert_eq!(task.callback_last_status_code, Some(500));
    assert!(task.callback_last_attempt_at.is_some());

    // the redelivery job is delayed, then becomes visible
    assert!(env.broker.pop().await.is_none());
    env.clock.advance(Duration::from_secs(2));
    let (queue, job) = env.broker.pop().await.unwrap();
    assert_eq!(queue, QueueName::Low);
    assert_eq!(job, Job::DeliverWebhook { delivery_id, queue_attempt: 2 });
}

#[tokio::test]
async fn callback_max_attempts_ends_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let env = env();
    let task = submit_task(
        &env,
        &server.uri(),
        NewTask { callback_max_attempts: Some(2), ..base_params() },
    )
    .await;
    let delivery_id =
        enqueue_webhook(&task, EVENT_SUCCEEDED, env.store.as_ref(), env.broker.as_ref(), env.clock.as_ref())
            .await
            .unwrap()
            .unwrap();

    assert_eq!(
        env.worker.process(delivery_id, 1).await.unwrap(),
        AttemptResult::RetryScheduled { next_queue_attempt: 2 }
    );
    // second POST exhausts the record-level ceiling
    assert_eq!(
        env.worker.process(delivery_id, 2).await.unwrap(),
        AttemptResult::Exhausted
    );

    let task = env.store.find_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.callback_status, CallbackStatus::Failure);
    assert_eq!(task.callback_attempts, 2);

    // further jobs for the record are refused without another POST
    assert_eq!(
        env.worker.process(delivery_id, 3).await.unwrap(),
        AttemptResult::Exhausted
    );
    let task = env.store.find_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.callback_attempts, 2);
}

#[tokio::test]
async fn queue_ceiling_ends_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let env = env_with_policy(RetryPolicy {
        max_attempts: 2,
        jitter_factor: 0.0,
        ..Default::default()
    });
    let task = submit_task(&env, &server.uri(), base_params()).await;
    let delivery_id =
        enqueue_webhook(&task, EVENT_SUCCEEDED, env.store.as_ref(), env.broker.as_ref(), env.clock.as_ref())
            .await
            .unwrap()
            .unwrap();

    assert_eq!(
        env.worker.process(delivery_id, 1).await.unwrap(),
        AttemptResult::RetryScheduled { next_queue_attempt: 2 }
    );
    assert_eq!(
        env.worker.process(delivery_id, 2).await.unwrap(),
        AttemptResult::Exhausted
    );

    let task = env.store.find_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.callback_status, CallbackStatus::Failure);
}

#[tokio::test]
async fn replay_sends_original_frozen_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let env = env();
    let task = submit_task(&env, &server.uri(), base_params()).await;
    let original_id =
        enqueue_webhook(&task, EVENT_SUCCEEDED, env.store.as_ref(), env.broker.as_ref(), env.clock.as_ref())
            .await
            .unwrap()
            .unwrap();
    env.worker.process(original_id, 1).await.unwrap();

    // the task mutates after the original was frozen
    env.store
        .mark_success(task.id, json!({"late": true}), env.clock.now_utc())
        .await
        .unwrap();

    let replay_id = env.worker.replay(original_id).await.unwrap();
    assert_ne!(replay_id, original_id);

    let original = env.store.find_delivery(original_id).await.unwrap().unwrap();
    let replay = env.store.find_delivery(replay_id).await.unwrap().unwrap();
    assert_eq!(replay.replay_of, Some(original_id));
    assert_eq!(replay.status, DeliveryStatus::Pending);
    assert_eq!(replay.attempts, 0);
    assert_eq!(replay.request_body, original.request_body);
    assert_eq!(replay.request_headers, original.request_headers);
    assert_eq!(replay.signature, original.signature);

    assert_eq!(
        env.worker.process(replay_id, 1).await.unwrap(),
        AttemptResult::Delivered
    );
    // replayed body still carries the pre-mutation snapshot
    let body: serde_json::Value = serde_json::from_str(&replay.request_body).unwrap();
    assert_eq!(body["task"]["result"], serde_json::Value::Null);
}

#[tokio::test]
async fn already_delivered_record_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = env();
    let task = submit_task(&env, &server.uri(), base_params()).await;
    let delivery_id =
        enqueue_webhook(&task, EVENT_SUCCEEDED, env.store.as_ref(), env.broker.as_ref(), env.clock.as_ref())
            .await
            .unwrap()
            .unwrap();

    assert_eq!(env.worker.process(delivery_id, 1).await.unwrap(), AttemptResult::Delivered);
    // duplicate job (at-least-once broker) must not POST again
    assert_eq!(env.worker.process(delivery_id, 1).await.unwrap(), AttemptResult::Skipped);
}
