//! Handler registry and the built-in task handlers.
//!
//! The registry is assembled once at startup and resolved per execution by
//! registry key (`task_type`). Handlers receive the task payload and return
//! a JSON result; any error they report is retryable from the executor's
//! point of view.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use taskqueue_core::Clock;

/// Error reported by a handler. Always retryable.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// A unit of executable work, resolved by `task_type`.
#[async_trait]
pub trait TaskHandler: Send + Sync + std::fmt::Debug {
    async fn run(&self, payload: &Map<String, Value>) -> HandlerResult;
}

/// Maps registry keys to handlers. Immutable after startup.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler installed.
    pub fn builtin(clock: Arc<dyn Clock>) -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(EchoHandler));
        registry.register("compute", Arc::new(ComputeHandler));
        registry.register("sleep", Arc::new(SleepHandler { clock }));
        registry.register("http_request", Arc::new(HttpRequestHandler::new()));
        registry.register("process_data", Arc::new(ProcessDataHandler));
        registry.register("send_email", Arc::new(SendEmailHandler));
        registry.register("resize_image", Arc::new(ResizeImageHandler));
        registry.register("generate_report", Arc::new(GenerateReportHandler));
        registry
    }

    pub fn register(&mut self, key: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(key.into(), handler);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    /// Registered keys, sorted for stable logging.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

/// Returns its payload back, wrapped for identification.
#[derive(Debug)]
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn run(&self, payload: &Map<String, Value>) -> HandlerResult {
        Ok(json!({ "echoed": payload }))
    }
}

/// Arithmetic over a list of numbers: sum, product, or average.
#[derive(Debug)]
pub struct ComputeHandler;

#[async_trait]
impl TaskHandler for ComputeHandler {
    async fn run(&self, payload: &Map<String, Value>) -> HandlerResult {
        let numbers = parse_numbers(payload)?;
        let operation = payload
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("sum");

        let result = match operation {
            "sum" => numbers.iter().sum::<f64>(),
            "product" => numbers.iter().product::<f64>(),
            // empty list averages to zero rather than erroring
            "average" if numbers.is_empty() => 0.0,
            "average" => numbers.iter().sum::<f64>() / numbers.len() as f64,
            other => {
                return Err(HandlerError::new(format!("unknown operation: {other}")));
            }
        };

        Ok(json!({ "operation": operation, "result": result }))
    }
}

fn parse_numbers(payload: &Map<String, Value>) -> std::result::Result<Vec<f64>, HandlerError> {
    let Some(raw) = payload.get("numbers") else {
        return Ok(Vec::new());
    };
    let Some(items) = raw.as_array() else {
        return Err(HandlerError::new("'numbers' must be an array"));
    };
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| HandlerError::new(format!("non-numeric value in 'numbers': {v}")))
        })
        .collect()
}

/// Sleeps for the requested duration, clamped to five minutes.
#[derive(Debug)]
pub struct SleepHandler {
    pub clock: Arc<dyn Clock>,
}

/// Upper bound on a single sleep, in seconds.
const MAX_SLEEP_SECS: f64 = 300.0;

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn run(&self, payload: &Map<String, Value>) -> HandlerResult {
        let requested = payload
            .get("duration")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        let duration = requested.clamp(0.0, MAX_SLEEP_SECS);
        self.clock.sleep(Duration::from_secs_f64(duration)).await;
        Ok(json!({ "slept_for": duration }))
    }
}

/// Fetches a URL with GET and reports status and body size.
#[derive(Debug)]
pub struct HttpRequestHandler {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpRequestHandler {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new(), timeout: Duration::from_secs(30) }
    }
}

impl Default for HttpRequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for HttpRequestHandler {
    async fn run(&self, payload: &Map<String, Value>) -> HandlerResult {
        let url = payload
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("'url' is required"))?;

        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| HandlerError::new(format!("request failed: {e}")))?;
        let status_code = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| HandlerError::new(format!("failed to read response: {e}")))?;

        Ok(json!({
            "url": url,
            "status_code": status_code,
            "content_length": bytes.len(),
        }))
    }
}

/// Transforms, filters, or aggregates a list of items.
#[derive(Debug)]
pub struct ProcessDataHandler;

#[async_trait]
impl TaskHandler for ProcessDataHandler {
    async fn run(&self, payload: &Map<String, Value>) -> HandlerResult {
        let data = payload
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let operation = payload
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("transform");

        let count = data.len();
        let result = match operation {
            "transform" => Value::Array(data.into_iter().map(transform_item).collect()),
            "filter" => {
                let predicate = payload
                    .get("predicate")
                    .and_then(Value::as_str)
                    .unwrap_or("truthy");
                let kept = match predicate {
                    "truthy" => data.into_iter().filter(is_truthy).collect(),
                    "even" => data.into_iter().filter(is_even_integer).collect(),
                    other => {
                        debug!(predicate = %other, "unknown predicate, keeping all items");
                        data
                    }
                };
                Value::Array(kept)
            }
            "aggregate" => json!({ "count": count, "items": data }),
            other => {
                debug!(operation = %other, "unknown operation, passing data through");
                Value::Array(data)
            }
        };

        Ok(json!({ "operation": operation, "result": result, "count": count }))
    }
}

/// Uppercases strings and doubles numbers; other values pass unchanged.
fn transform_item(item: Value) -> Value {
    match item {
        Value::String(s) => Value::String(s.to_uppercase()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                json!(i * 2)
            } else if let Some(f) = n.as_f64() {
                json!(f * 2.0)
            } else {
                Value::Number(n)
            }
        }
        other => other,
    }
}

/// Even integers only; floats and non-numbers never match.
fn is_even_integer(item: &Value) -> bool {
    item.as_i64().is_some_and(|i| i % 2 == 0)
}

fn is_truthy(item: &Value) -> bool {
    match item {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Simulated email dispatch.
#[derive(Debug)]
pub struct SendEmailHandler;

#[async_trait]
impl TaskHandler for SendEmailHandler {
    async fn run(&self, payload: &Map<String, Value>) -> HandlerResult {
        let to = payload
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("'to' is required"))?;
        let subject = payload
            .get("subject")
            .and_then(Value::as_str)
            .unwrap_or("");
        Ok(json!({ "sent": true, "to": to, "subject": subject }))
    }
}

/// Simulated image resize.
#[derive(Debug)]
pub struct ResizeImageHandler;

#[async_trait]
impl TaskHandler for ResizeImageHandler {
    async fn run(&self, payload: &Map<String, Value>) -> HandlerResult {
        let width = required_dimension(payload, "width")?;
        let height = required_dimension(payload, "height")?;
        Ok(json!({ "resized": true, "width": width, "height": height }))
    }
}

fn required_dimension(
    payload: &Map<String, Value>,
    key: &str,
) -> std::result::Result<u64, HandlerError> {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .filter(|&v| v > 0)
        .ok_or_else(|| HandlerError::new(format!("'{key}' must be a positive integer")))
}

/// Simulated report generation.
#[derive(Debug)]
pub struct GenerateReportHandler;

#[async_trait]
impl TaskHandler for GenerateReportHandler {
    async fn run(&self, payload: &Map<String, Value>) -> HandlerResult {
        let rows = payload.get("rows").and_then(Value::as_u64).unwrap_or(0);
        let format = payload
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("csv");
        Ok(json!({ "report": { "rows": rows, "format": format } }))
    }
}
