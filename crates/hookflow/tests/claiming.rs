mod common;

use common::{
    engine, event, hook_url, insert_webhook, make_retries_due, mock_endpoint, setup_db,
    test_config, EVENT_TYPE,
};
use hookflow::webhooks::attempts::NewAttempt;
use hookflow::webhooks::{AttemptStatus, Engine};

use serial_test::serial;
use std::collections::HashSet;
use uuid::Uuid;

#[tokio::test]
#[serial]
async fn two_pollers_never_claim_the_same_retry() {
    let pool = setup_db().await;
    let engine_a = engine(&pool);
    let engine_b = Engine::new(pool.clone(), test_config("worker-b")).unwrap();
    let server = mock_endpoint(500).await;

    let tenant = Uuid::new_v4();
    insert_webhook(&engine_a, tenant, &hook_url(&server), 3).await;

    for i in 0..20 {
        engine_a
            .fanout
            .deliver(&event(tenant, &format!("evt_claim{i}")))
            .await
            .unwrap();
    }
    make_retries_due(&pool).await;

    let (a, b) = tokio::join!(
        engine_a.scheduler.claim_due(50),
        engine_b.scheduler.claim_due(50)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.len() + b.len(), 20);

    let events: HashSet<_> = a
        .iter()
        .chain(b.iter())
        .map(|c| c.attempt.event_id.clone())
        .collect();
    assert_eq!(events.len(), 20);

    for c in &a {
        assert_eq!(c.attempt.attempt_number, 2);
        assert_eq!(c.attempt.claimed_by.as_deref(), Some("test-worker"));
        assert_eq!(c.attempt.status(), Some(AttemptStatus::Pending));
    }
    for c in &b {
        assert_eq!(c.attempt.claimed_by.as_deref(), Some("worker-b"));
    }

    // nothing left for a second round
    assert!(engine_a.scheduler.claim_due(50).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn next_attempt_cannot_be_created_twice() {
    let pool = setup_db().await;
    let engine = engine(&pool);

    let webhook = insert_webhook(&engine, Uuid::new_v4(), "https://example.com/hook", 3).await;
    let new = NewAttempt {
        webhook_id: webhook.id,
        event_type: EVENT_TYPE,
        event_id: "evt_unique",
        attempt_number: 2,
        payload: "{}",
    };

    let first = engine.attempts.insert_pending(&new, "w1", 60).await.unwrap();
    let second = engine.attempts.insert_pending(&new, "w2", 60).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
}

#[tokio::test]
#[serial]
async fn expired_lease_becomes_a_transient_failure() {
    let pool = setup_db().await;
    let engine = engine(&pool);

    let webhook = insert_webhook(&engine, Uuid::new_v4(), "https://example.com/hook", 3).await;

    // a worker leased attempt 1 and died five seconds ago
    let orphan = engine
        .attempts
        .insert_pending(
            &NewAttempt {
                webhook_id: webhook.id,
                event_type: EVENT_TYPE,
                event_id: "evt_orphan",
                attempt_number: 1,
                payload: "{}",
            },
            "dead-worker",
            -5,
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(engine.scheduler.reap_expired_leases(100).await.unwrap(), 1);

    let a = engine.attempts.get(orphan.id).await.unwrap().unwrap();
    assert_eq!(a.status(), Some(AttemptStatus::FailedRetryable));
    assert_eq!(a.error_code.as_deref(), Some("LEASE_EXPIRED"));
    assert!(a.error_message.as_deref().unwrap().contains("dead-worker"));
    assert!(a.next_retry_at.is_some());
    assert!(a.lease_expires_at.is_none());

    // a live lease is not touched
    let live = engine
        .attempts
        .insert_pending(
            &NewAttempt {
                webhook_id: webhook.id,
                event_type: EVENT_TYPE,
                event_id: "evt_live",
                attempt_number: 1,
                payload: "{}",
            },
            "live-worker",
            60,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(engine.scheduler.reap_expired_leases(100).await.unwrap(), 0);
    let still = engine.attempts.get(live.id).await.unwrap().unwrap();
    assert_eq!(still.status(), Some(AttemptStatus::Pending));
}

#[tokio::test]
#[serial]
async fn expired_lease_on_last_attempt_exhausts_the_sequence() {
    let pool = setup_db().await;
    let engine = engine(&pool);

    let webhook = insert_webhook(&engine, Uuid::new_v4(), "https://example.com/hook", 1).await;
    let orphan = engine
        .attempts
        .insert_pending(
            &NewAttempt {
                webhook_id: webhook.id,
                event_type: EVENT_TYPE,
                event_id: "evt_orphan_last",
                attempt_number: 1,
                payload: "{}",
            },
            "dead-worker",
            -5,
        )
        .await
        .unwrap()
        .unwrap();

    engine.scheduler.reap_expired_leases(100).await.unwrap();

    let a = engine.attempts.get(orphan.id).await.unwrap().unwrap();
    assert_eq!(a.status(), Some(AttemptStatus::FailedFinal));
    assert_eq!(a.error_code.as_deref(), Some("EXHAUSTED"));

    let w = engine.webhooks.get(webhook.id).await.unwrap().unwrap();
    assert_eq!(w.consecutive_failure_count, 1);
}

#[tokio::test]
#[serial]
async fn late_outcome_does_not_overwrite_a_reaped_attempt() {
    let pool = setup_db().await;
    let engine = engine(&pool);

    let webhook = insert_webhook(&engine, Uuid::new_v4(), "https://example.com/hook", 3).await;
    let orphan = engine
        .attempts
        .insert_pending(
            &NewAttempt {
                webhook_id: webhook.id,
                event_type: EVENT_TYPE,
                event_id: "evt_late",
                attempt_number: 1,
                payload: "{}",
            },
            "slow-worker",
            -5,
        )
        .await
        .unwrap()
        .unwrap();

    engine.scheduler.reap_expired_leases(100).await.unwrap();

    let late = engine
        .attempts
        .mark_success(orphan.id, &Default::default())
        .await
        .unwrap();
    assert!(late.is_none());

    let a = engine.attempts.get(orphan.id).await.unwrap().unwrap();
    assert_eq!(a.status(), Some(AttemptStatus::FailedRetryable));
}

#[tokio::test]
#[serial]
async fn reaped_claim_is_never_sent() {
    let pool = setup_db().await;
    let engine = engine(&pool);
    let server = mock_endpoint(200).await;

    let webhook = insert_webhook(&engine, Uuid::new_v4(), &hook_url(&server), 3).await;

    // claimed by this worker, then left queued past its lease
    let queued = engine
        .attempts
        .insert_pending(
            &NewAttempt {
                webhook_id: webhook.id,
                event_type: EVENT_TYPE,
                event_id: "evt_queued",
                attempt_number: 1,
                payload: "{}",
            },
            "test-worker",
            -5,
        )
        .await
        .unwrap()
        .unwrap();

    let other = Engine::new(pool.clone(), test_config("worker-b")).unwrap();
    assert_eq!(other.scheduler.reap_expired_leases(100).await.unwrap(), 1);

    let settled = engine.dispatcher.deliver(&webhook, queued).await.unwrap();
    assert_eq!(settled.status(), Some(AttemptStatus::FailedRetryable));
    assert_eq!(settled.error_code.as_deref(), Some("LEASE_EXPIRED"));
    assert!(server.received_requests().await.unwrap().is_empty());

    // the reaped attempt is retried once, as attempt 2, not sent twice
    make_retries_due(&pool).await;
    assert_eq!(engine.retry_worker.tick().await.unwrap(), 1);
    let seq = engine
        .attempts
        .list_sequence(webhook.id, "evt_queued")
        .await
        .unwrap();
    assert_eq!(seq.len(), 2);
    assert_eq!(seq[1].status(), Some(AttemptStatus::Success));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn stale_but_unreaped_claim_is_re_leased_and_sent() {
    let pool = setup_db().await;
    let engine = engine(&pool);
    let server = mock_endpoint(200).await;

    let webhook = insert_webhook(&engine, Uuid::new_v4(), &hook_url(&server), 3).await;
    let queued = engine
        .attempts
        .insert_pending(
            &NewAttempt {
                webhook_id: webhook.id,
                event_type: EVENT_TYPE,
                event_id: "evt_slow_queue",
                attempt_number: 1,
                payload: "{}",
            },
            "test-worker",
            -5,
        )
        .await
        .unwrap()
        .unwrap();

    let renewed = engine
        .attempts
        .renew_lease(queued.id, "test-worker", 60)
        .await
        .unwrap()
        .unwrap();
    assert!(renewed.lease_expires_at.unwrap() > chrono::Utc::now());
    // nobody else can take it over
    assert!(engine
        .attempts
        .renew_lease(queued.id, "worker-b", 60)
        .await
        .unwrap()
        .is_none());
    assert_eq!(engine.scheduler.reap_expired_leases(100).await.unwrap(), 0);

    let settled = engine.dispatcher.deliver(&webhook, queued).await.unwrap();
    assert_eq!(settled.status(), Some(AttemptStatus::Success));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn claim_owned_by_another_worker_is_not_sent() {
    let pool = setup_db().await;
    let engine = engine(&pool);
    let server = mock_endpoint(200).await;

    let webhook = insert_webhook(&engine, Uuid::new_v4(), &hook_url(&server), 3).await;
    let foreign = engine
        .attempts
        .insert_pending(
            &NewAttempt {
                webhook_id: webhook.id,
                event_type: EVENT_TYPE,
                event_id: "evt_foreign",
                attempt_number: 1,
                payload: "{}",
            },
            "worker-b",
            60,
        )
        .await
        .unwrap()
        .unwrap();

    let settled = engine.dispatcher.deliver(&webhook, foreign).await.unwrap();
    assert_eq!(settled.status(), Some(AttemptStatus::Pending));
    assert_eq!(settled.claimed_by.as_deref(), Some("worker-b"));
    assert!(server.received_requests().await.unwrap().is_empty());
}
