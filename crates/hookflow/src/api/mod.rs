use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::api::models::{
    ListAttemptsQuery, ListAttemptsResponse, PublishAccepted, PublishEventRequest, StatsQuery,
    StatsResponse,
};
use crate::webhooks::{
    AttemptFilter, AttemptStatus, DeliveryAttempt, Engine, EventPublisher, Webhook,
};

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Engine,
    pub publisher: EventPublisher,
    pub stats_window_days: i64,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Intake
        .route("/events", post(publish_event))
        // Inspect
        .route("/webhooks/:id/attempts", get(list_attempts))
        .route(
            "/webhooks/:id/events/:event_id/attempts",
            get(list_event_attempts),
        )
        .route("/webhooks/:id/stats", get(webhook_stats))
        .route("/webhooks/:id/test", post(send_test))
        // Metrics
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

fn internal_err(e: anyhow::Error) -> (StatusCode, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("internal error: {e}"),
    )
}

async fn load_webhook(state: &ApiState, id: Uuid) -> Result<Webhook, (StatusCode, String)> {
    state
        .engine
        .webhooks
        .get(id)
        .await
        .map_err(internal_err)?
        .ok_or((StatusCode::NOT_FOUND, "webhook not found".to_string()))
}

pub async fn publish_event(
    State(state): State<ApiState>,
    Json(body): Json<PublishEventRequest>,
) -> Result<(StatusCode, Json<PublishAccepted>), (StatusCode, String)> {
    if body.event_type.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "event_type is required".into()));
    }
    if body.event_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "event_id is required".into()));
    }

    let event_id = body.event_id.clone();
    state.publisher.publish_event(body.into()).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishAccepted {
            accepted: true,
            event_id,
        }),
    ))
}

pub async fn list_attempts(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(q): Query<ListAttemptsQuery>,
) -> Result<Json<ListAttemptsResponse>, (StatusCode, String)> {
    let status = match q.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            AttemptStatus::parse(s)
                .ok_or((StatusCode::BAD_REQUEST, format!("unknown status {s:?}")))?,
        ),
    };

    load_webhook(&state, id).await?;

    let filter = AttemptFilter {
        status,
        since: q.since,
        until: q.until,
        limit: q.limit.unwrap_or(100),
        cursor_created_at: q.cursor_created_at,
        cursor_id: q.cursor_id,
    };

    let items = state
        .engine
        .attempts
        .list_for_webhook(id, &filter)
        .await
        .map_err(internal_err)?;

    let (next_cursor_created_at, next_cursor_id) = items
        .last()
        .map(|x| (Some(x.created_at), Some(x.id)))
        .unwrap_or((None, None));

    Ok(Json(ListAttemptsResponse {
        items,
        next_cursor_created_at,
        next_cursor_id,
    }))
}

pub async fn list_event_attempts(
    State(state): State<ApiState>,
    Path((id, event_id)): Path<(Uuid, String)>,
) -> Result<Json<Vec<DeliveryAttempt>>, (StatusCode, String)> {
    load_webhook(&state, id).await?;

    let rows = state
        .engine
        .attempts
        .list_sequence(id, &event_id)
        .await
        .map_err(internal_err)?;

    Ok(Json(rows))
}

pub async fn webhook_stats(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, (StatusCode, String)> {
    let webhook = load_webhook(&state, id).await?;
    let window_days = q.window_days.unwrap_or(state.stats_window_days);

    let stats = state
        .engine
        .stats
        .for_webhook(id, window_days)
        .await
        .map_err(internal_err)?;

    Ok(Json(StatsResponse {
        stats,
        consecutive_failure_count: webhook.consecutive_failure_count,
        disabled_at: webhook.disabled_at,
        last_triggered_at: webhook.last_triggered_at,
    }))
}

pub async fn send_test(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryAttempt>, (StatusCode, String)> {
    let webhook = load_webhook(&state, id).await?;

    if !webhook.is_dispatchable() {
        return Err((
            StatusCode::CONFLICT,
            "webhook is inactive or disabled".to_string(),
        ));
    }

    match state.engine.fanout.send_test(&webhook).await {
        Ok(Some(attempt)) => Ok(Json(attempt)),
        Ok(None) => Err((
            StatusCode::CONFLICT,
            "test delivery was not created".to_string(),
        )),
        Err(e) => Err(internal_err(e)),
    }
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    let snapshot = async {
        let by_status = state.engine.attempts.counts_by_status().await?;
        let due = state.engine.attempts.count_due().await?;
        let disabled = state.engine.webhooks.count_disabled().await?;
        Ok::<_, anyhow::Error>((by_status, due, disabled))
    };

    match snapshot.await {
        Ok((by_status, due, disabled)) => {
            (StatusCode::OK, render_prometheus(&by_status, due, disabled)).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics error: {e}"),
        )
            .into_response(),
    }
}

/// Prometheus text exposition for the delivery gauges. Every status gets a
/// line, including ones with no rows yet.
pub fn render_prometheus(by_status: &[(String, i64)], due: i64, disabled: i64) -> String {
    let mut out = String::new();

    out.push_str("# HELP hookflow_delivery_attempts Delivery attempts by status\n");
    out.push_str("# TYPE hookflow_delivery_attempts gauge\n");
    for status in [
        AttemptStatus::Pending,
        AttemptStatus::Success,
        AttemptStatus::FailedRetryable,
        AttemptStatus::FailedFinal,
    ] {
        let n = by_status
            .iter()
            .find(|(s, _)| s == status.as_str())
            .map(|(_, n)| *n)
            .unwrap_or(0);
        out.push_str(&format!(
            "hookflow_delivery_attempts{{status=\"{}\"}} {}\n",
            status.as_str(),
            n
        ));
    }

    out.push_str(concat!(
        "# HELP hookflow_retries_due Retryable attempts whose retry time has passed\n",
        "# TYPE hookflow_retries_due gauge\n",
    ));
    out.push_str(&format!("hookflow_retries_due {due}\n"));

    out.push_str(concat!(
        "# HELP hookflow_webhooks_disabled Webhooks disabled by the circuit breaker\n",
        "# TYPE hookflow_webhooks_disabled gauge\n",
    ));
    out.push_str(&format!("hookflow_webhooks_disabled {disabled}\n"));

    out
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_output_lists_every_status() {
        let body = render_prometheus(&[("success".into(), 7), ("failed_final".into(), 2)], 3, 1);

        assert!(body.contains("hookflow_delivery_attempts{status=\"success\"} 7\n"));
        assert!(body.contains("hookflow_delivery_attempts{status=\"failed_final\"} 2\n"));
        assert!(body.contains("hookflow_delivery_attempts{status=\"pending\"} 0\n"));
        assert!(body.contains("hookflow_delivery_attempts{status=\"failed_retryable\"} 0\n"));
        assert!(body.contains("hookflow_retries_due 3\n"));
        assert!(body.contains("hookflow_webhooks_disabled 1\n"));
    }
}
