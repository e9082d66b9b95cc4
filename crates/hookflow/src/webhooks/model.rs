use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::webhooks::retry::RetryPolicy;

pub type TenantId = Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Webhook {
    pub id: Uuid,
    pub tenant_id: TenantId,

    pub url: String,
    pub event_types: Vec<String>,
    #[serde(skip_serializing)]
    pub secret: String,
    pub custom_headers: Json<BTreeMap<String, String>>,

    pub max_attempts: i32,
    pub backoff_seconds: Vec<i32>,

    pub active: bool,
    pub consecutive_failure_count: i32,
    pub disabled_at: Option<DateTime<Utc>>,
    pub last_triggered_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_columns(self.max_attempts, &self.backoff_seconds)
    }

    /// Active and not tripped by the circuit breaker.
    pub fn is_dispatchable(&self) -> bool {
        self.active && self.disabled_at.is_none()
    }

    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|t| t == event_type)
    }
}

/// Insert shape for webhook rows. Configuration CRUD lives outside this crate;
/// this exists for seeding (hookctl) and tests.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub tenant_id: TenantId,
    pub url: String,
    pub event_types: Vec<String>,
    pub secret: String,
    pub custom_headers: BTreeMap<String, String>,
    pub max_attempts: i32,
    pub backoff_seconds: Vec<i32>,
}

impl NewWebhook {
    pub fn new(
        tenant_id: TenantId,
        url: impl Into<String>,
        event_types: &[&str],
        secret: impl Into<String>,
    ) -> Self {
        let policy = RetryPolicy::default();
        Self {
            tenant_id,
            url: url.into(),
            event_types: event_types.iter().map(|s| s.to_string()).collect(),
            secret: secret.into(),
            custom_headers: BTreeMap::new(),
            max_attempts: policy.max_attempts,
            backoff_seconds: policy.backoff_columns(),
        }
    }
}

/// What a producer hands to `publish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub event_type: String,
    pub event_id: String,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub data: Value,
}

impl PublishedEvent {
    pub fn new(
        event_type: impl Into<String>,
        event_id: impl Into<String>,
        tenant_id: TenantId,
        data: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: event_id.into(),
            tenant_id,
            data,
        }
    }

    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_type: self.event_type.clone(),
            event_id: self.event_id.clone(),
            created_at: Utc::now(),
            data: self.data.clone(),
        }
    }
}

/// The body every subscriber receives. `data` is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub event_id: String,
    pub created_at: DateTime<Utc>,
    pub data: Value,
}

impl EventEnvelope {
    /// Canonical wire bytes: compact JSON, fields in struct order. Equal
    /// envelopes give equal bytes; the result is stored and replayed verbatim.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Success,
    FailedRetryable,
    FailedFinal,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Success => "success",
            AttemptStatus::FailedRetryable => "failed_retryable",
            AttemptStatus::FailedFinal => "failed_final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(AttemptStatus::Pending),
            "success" => Some(AttemptStatus::Success),
            "failed_retryable" => Some(AttemptStatus::FailedRetryable),
            "failed_final" => Some(AttemptStatus::FailedFinal),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Success | AttemptStatus::FailedFinal)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event_type: String,
    pub event_id: String,
    pub attempt_number: i32,

    #[serde(skip_serializing)]
    pub payload: String,

    pub status: String,
    pub http_status: Option<i32>,
    pub response_body: Option<String>,
    pub elapsed_ms: Option<i32>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,

    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,

    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn status(&self) -> Option<AttemptStatus> {
        AttemptStatus::parse(&self.status)
    }
}

/// Measured facts about one HTTP exchange, whatever its outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptResult {
    pub http_status: Option<i32>,
    pub response_body: Option<String>,
    pub elapsed_ms: Option<i32>,
}
