//! Delivery failure taxonomy.
//!
//! None of these ever reach the producer of an event. They are recorded on the
//! attempt row (`error_code` + `error_message`) and drive the retry and
//! circuit-breaker decisions.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    Connection,
    HttpStatus,
    /// The worker that owned a pending attempt disappeared before recording it.
    LeaseExpired,
}

impl TransientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::Timeout => "TIMEOUT",
            TransientKind::Connection => "CONNECTION",
            TransientKind::HttpStatus => "HTTP_STATUS",
            TransientKind::LeaseExpired => "LEASE_EXPIRED",
        }
    }
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("invalid webhook configuration: {0}")]
    Configuration(String),

    #[error("{kind}: {message}")]
    Transient {
        kind: TransientKind,
        status: Option<u16>,
        message: String,
    },

    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    ExhaustedRetries { attempts: i32, last_error: String },

    #[error("signature computation failed: {0}")]
    Signature(String),

    #[error("webhook unavailable: {0}")]
    WebhookUnavailable(String),
}

impl DeliveryError {
    pub fn http_status(status: u16) -> Self {
        DeliveryError::Transient {
            kind: TransientKind::HttpStatus,
            status: Some(status),
            message: format!("HTTP {status}"),
        }
    }

    /// Classify a reqwest failure that produced no response.
    pub fn from_request(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransientKind::Timeout
        } else {
            TransientKind::Connection
        };
        DeliveryError::Transient {
            kind,
            status: None,
            message: err.to_string(),
        }
    }

    pub fn lease_expired(worker: Option<&str>) -> Self {
        DeliveryError::Transient {
            kind: TransientKind::LeaseExpired,
            status: None,
            message: format!(
                "lease held by {} expired before the outcome was recorded",
                worker.unwrap_or("unknown worker")
            ),
        }
    }

    /// Stable code persisted in `delivery_attempts.error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::Configuration(_) => "CONFIGURATION",
            DeliveryError::Transient { kind, .. } => kind.as_str(),
            DeliveryError::ExhaustedRetries { .. } => "EXHAUSTED",
            DeliveryError::Signature(_) => "SIGNATURE",
            DeliveryError::WebhookUnavailable(_) => "WEBHOOK_UNAVAILABLE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient { .. })
    }

    /// Failures raised before any byte hits the network.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            DeliveryError::Configuration(_) | DeliveryError::Signature(_)
        )
    }
}
