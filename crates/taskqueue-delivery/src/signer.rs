//! Request signing and header preparation for outbound webhooks.
//!
//! Signatures are hex-encoded HMAC-SHA256 over the exact body bytes that
//! will be sent. Receivers recompute the digest with their shared secret
//! and compare in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use taskqueue_core::Task;

use crate::error::DeliveryError;

type HmacSha256 = Hmac<Sha256>;

/// User-Agent sent on every webhook POST.
pub const USER_AGENT: &str = concat!("taskqueue/", env!("CARGO_PKG_VERSION"));

/// Header carrying the event name.
pub const EVENT_HEADER: &str = "X-Taskqueue-Event";
/// Header carrying the task ID.
pub const TASK_ID_HEADER: &str = "X-Taskqueue-Task-Id";
/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Taskqueue-Signature";

/// Computes the hex HMAC-SHA256 signature of a request body.
pub fn compute_signature(secret: &str, body: &[u8]) -> Result<String, DeliveryError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| DeliveryError::configuration("unusable signing secret"))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Builds the full header set for a delivery, frozen into the record.
///
/// Base headers first, then the task's `callback_headers` overlaid on top,
/// so custom headers can override the computed ones. Non-string custom
/// values are silently dropped.
pub fn prepare_headers(
    task: &Task,
    event: &str,
    signature: Option<&str>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = vec![
        ("Content-Type".into(), "application/json".into()),
        ("User-Agent".into(), USER_AGENT.into()),
        (EVENT_HEADER.into(), event.to_owned()),
        (TASK_ID_HEADER.into(), task.id.to_string()),
    ];
    if let Some(sig) = signature {
        headers.push((SIGNATURE_HEADER.into(), sig.to_owned()));
    }

    for (name, value) in &task.callback_headers {
        if let Some(text) = value.as_str() {
            if let Some(existing) = headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name))
            {
                existing.1 = text.to_owned();
            } else {
                headers.push((name.clone(), text.to_owned()));
            }
        }
    }

    headers
}

/// Constant-time comparison for signature verification.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
