use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::webhooks::{DeliveryAttempt, DeliveryStats, PublishedEvent};

#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    pub event_type: String,
    pub event_id: String,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub data: Value,
}

impl From<PublishEventRequest> for PublishedEvent {
    fn from(r: PublishEventRequest) -> Self {
        PublishedEvent::new(r.event_type, r.event_id, r.tenant_id, r.data)
    }
}

#[derive(Debug, Serialize)]
pub struct PublishAccepted {
    pub accepted: bool,
    pub event_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListAttemptsQuery {
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor_created_at: Option<DateTime<Utc>>,
    pub cursor_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ListAttemptsResponse {
    pub items: Vec<DeliveryAttempt>,
    pub next_cursor_created_at: Option<DateTime<Utc>>,
    pub next_cursor_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub window_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: DeliveryStats,
    pub consecutive_failure_count: i32,
    pub disabled_at: Option<DateTime<Utc>>,
    pub last_triggered_at: Option<DateTime<Utc>>,
}
