mod common;

use common::{
    engine, event, hook_url, insert_webhook, make_retries_due, mock_endpoint, setup_db,
};
use hookflow::webhooks::AttemptStatus;

use chrono::{Duration, Utc};
use serial_test::serial;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
#[serial]
async fn failing_endpoint_exhausts_three_attempts() {
    let pool = setup_db().await;
    let engine = engine(&pool);
    let server = mock_endpoint(500).await;

    let tenant = Uuid::new_v4();
    let webhook = insert_webhook(&engine, tenant, &hook_url(&server), 3).await;

    let first = engine.fanout.deliver(&event(tenant, "evt_b")).await.unwrap();
    assert_eq!(first[0].status(), Some(AttemptStatus::FailedRetryable));

    for _ in 0..2 {
        make_retries_due(&pool).await;
        assert_eq!(engine.retry_worker.tick().await.unwrap(), 1);
    }

    // nothing is left to claim
    make_retries_due(&pool).await;
    assert_eq!(engine.retry_worker.tick().await.unwrap(), 0);

    let seq = engine
        .attempts
        .list_sequence(webhook.id, "evt_b")
        .await
        .unwrap();
    let numbers: Vec<i32> = seq.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    assert_eq!(seq[0].status(), Some(AttemptStatus::FailedRetryable));
    assert_eq!(seq[1].status(), Some(AttemptStatus::FailedRetryable));
    assert_eq!(seq[2].status(), Some(AttemptStatus::FailedFinal));
    assert_eq!(seq[2].error_code.as_deref(), Some("EXHAUSTED"));
    assert!(seq[2]
        .error_message
        .as_deref()
        .unwrap()
        .contains("HTTP 500"));
    assert!(seq.iter().all(|a| a.http_status == Some(500)));
    // claimed retries no longer carry a due time
    assert!(seq.iter().all(|a| a.next_retry_at.is_none()));

    // every attempt replays the same bytes with its own delivery id
    assert!(seq.iter().all(|a| a.payload == seq[0].payload));
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 3);
    assert!(received.iter().all(|r| r.body == received[0].body));
    let sigs: Vec<_> = received
        .iter()
        .map(|r| r.headers.get("x-webhook-signature").unwrap().clone())
        .collect();
    assert!(sigs.iter().all(|s| s == &sigs[0]));
    let ids: std::collections::HashSet<_> = received
        .iter()
        .map(|r| r.headers.get("x-webhook-delivery-id").unwrap().clone())
        .collect();
    assert_eq!(ids.len(), 3);

    let w = engine.webhooks.get(webhook.id).await.unwrap().unwrap();
    assert_eq!(w.consecutive_failure_count, 1);
    assert!(w.disabled_at.is_none());
}

#[tokio::test]
#[serial]
async fn retries_follow_the_default_backoff() {
    let pool = setup_db().await;
    let engine = engine(&pool);
    let server = mock_endpoint(503).await;

    let tenant = Uuid::new_v4();
    let webhook = insert_webhook(&engine, tenant, &hook_url(&server), 3).await;

    let before = Utc::now();
    let first = engine.fanout.deliver(&event(tenant, "evt_backoff")).await.unwrap();
    let next1 = first[0].next_retry_at.unwrap();
    assert!(next1 >= before + Duration::seconds(59));
    assert!(next1 <= Utc::now() + Duration::seconds(61));

    make_retries_due(&pool).await;
    let before = Utc::now();
    engine.retry_worker.tick().await.unwrap();

    let seq = engine
        .attempts
        .list_sequence(webhook.id, "evt_backoff")
        .await
        .unwrap();
    let next2 = seq[1].next_retry_at.unwrap();
    assert!(next2 >= before + Duration::seconds(299));
    assert!(next2 <= Utc::now() + Duration::seconds(301));
}

#[tokio::test]
#[serial]
async fn success_on_retry_resets_the_failure_counter() {
    let pool = setup_db().await;
    let engine = engine(&pool);

    // first call fails, everything after succeeds
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let tenant = Uuid::new_v4();
    let webhook = insert_webhook(&engine, tenant, &format!("{}/hook", server.uri()), 3).await;
    sqlx::query("UPDATE webhooks SET consecutive_failure_count = 4 WHERE id = $1")
        .bind(webhook.id)
        .execute(&pool)
        .await
        .unwrap();

    engine.fanout.deliver(&event(tenant, "evt_flaky")).await.unwrap();
    make_retries_due(&pool).await;
    assert_eq!(engine.retry_worker.tick().await.unwrap(), 1);

    let seq = engine
        .attempts
        .list_sequence(webhook.id, "evt_flaky")
        .await
        .unwrap();
    assert_eq!(seq.len(), 2);
    assert_eq!(seq[0].status(), Some(AttemptStatus::FailedRetryable));
    assert_eq!(seq[1].status(), Some(AttemptStatus::Success));

    // a success stops the sequence
    make_retries_due(&pool).await;
    assert_eq!(engine.retry_worker.tick().await.unwrap(), 0);

    let w = engine.webhooks.get(webhook.id).await.unwrap().unwrap();
    assert_eq!(w.consecutive_failure_count, 0);
    assert!(w.last_triggered_at.is_some());
}

#[tokio::test]
#[serial]
async fn retry_for_disabled_webhook_is_dropped_at_claim() {
    let pool = setup_db().await;
    let engine = engine(&pool);
    let server = mock_endpoint(500).await;

    let tenant = Uuid::new_v4();
    let webhook = insert_webhook(&engine, tenant, &hook_url(&server), 3).await;

    engine.fanout.deliver(&event(tenant, "evt_drop")).await.unwrap();

    sqlx::query("UPDATE webhooks SET disabled_at = now() WHERE id = $1")
        .bind(webhook.id)
        .execute(&pool)
        .await
        .unwrap();

    make_retries_due(&pool).await;
    assert_eq!(engine.retry_worker.tick().await.unwrap(), 0);

    let seq = engine
        .attempts
        .list_sequence(webhook.id, "evt_drop")
        .await
        .unwrap();
    assert_eq!(seq.len(), 1);
    assert_eq!(seq[0].status(), Some(AttemptStatus::FailedFinal));
    assert_eq!(seq[0].error_code.as_deref(), Some("WEBHOOK_UNAVAILABLE"));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    // dropping is not a delivery failure
    let w = engine.webhooks.get(webhook.id).await.unwrap().unwrap();
    assert_eq!(w.consecutive_failure_count, 0);
}

#[tokio::test]
#[serial]
async fn lowered_retry_policy_finalizes_at_claim() {
    let pool = setup_db().await;
    let engine = engine(&pool);
    let server = mock_endpoint(500).await;

    let tenant = Uuid::new_v4();
    let webhook = insert_webhook(&engine, tenant, &hook_url(&server), 3).await;

    engine.fanout.deliver(&event(tenant, "evt_lowered")).await.unwrap();

    sqlx::query("UPDATE webhooks SET max_attempts = 1 WHERE id = $1")
        .bind(webhook.id)
        .execute(&pool)
        .await
        .unwrap();

    make_retries_due(&pool).await;
    assert_eq!(engine.retry_worker.tick().await.unwrap(), 0);

    let seq = engine
        .attempts
        .list_sequence(webhook.id, "evt_lowered")
        .await
        .unwrap();
    assert_eq!(seq.len(), 1);
    assert_eq!(seq[0].status(), Some(AttemptStatus::FailedFinal));
    assert_eq!(seq[0].error_code.as_deref(), Some("EXHAUSTED"));

    let w = engine.webhooks.get(webhook.id).await.unwrap().unwrap();
    assert_eq!(w.consecutive_failure_count, 1);
}

#[tokio::test]
#[serial]
async fn not_yet_due_retries_are_left_alone() {
    let pool = setup_db().await;
    let engine = engine(&pool);
    let server = mock_endpoint(500).await;

    let tenant = Uuid::new_v4();
    insert_webhook(&engine, tenant, &hook_url(&server), 3).await;
    engine.fanout.deliver(&event(tenant, "evt_later")).await.unwrap();

    // next_retry_at is a minute away
    assert_eq!(engine.retry_worker.tick().await.unwrap(), 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
