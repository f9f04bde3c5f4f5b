//! Error types for webhook delivery operations.

use thiserror::Error;

use taskqueue_core::CoreError;

/// Result type alias using `DeliveryError`.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors that can occur while enqueuing or attempting a webhook delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Network-level failure (DNS, connect, TLS, reset).
    #[error("network error: {message}")]
    Network { message: String },

    /// The request did not complete within the client timeout.
    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The receiver answered with a non-2xx status.
    #[error("non-2xx response: {status_code}")]
    HttpStatus { status_code: u16 },

    /// The broker-level retry ceiling for this delivery was reached.
    #[error("delivery abandoned after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    /// The task has no callback configured or the record is unusable.
    #[error("invalid delivery configuration: {message}")]
    Configuration { message: String },

    /// Underlying storage failure.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl DeliveryError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    pub fn timeout(timeout_secs: u64) -> Self {
        Self::Timeout { timeout_secs }
    }

    pub fn http_status(status_code: u16) -> Self {
        Self::HttpStatus { status_code }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the queue should attempt this delivery again.
    ///
    /// Every non-2xx response is retryable here. The receiving side of a
    /// webhook is often misconfigured transiently (bad deploy, rotated
    /// route), so 4xx is not treated as permanent the way an API client
    /// would.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::HttpStatus { .. } => true,
            Self::AttemptsExhausted { .. } | Self::Configuration { .. } | Self::Core(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_http_errors_are_retryable() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(10).is_retryable());
        assert!(DeliveryError::http_status(500).is_retryable());
        assert!(DeliveryError::http_status(404).is_retryable());
    }

    #[test]
    fn exhaustion_and_config_errors_are_not() {
        assert!(!DeliveryError::AttemptsExhausted { attempts: 10 }.is_retryable());
        assert!(!DeliveryError::configuration("no callback_url").is_retryable());
    }
}
