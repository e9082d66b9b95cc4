use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::webhooks::dispatcher::Dispatcher;
use crate::webhooks::model::{DeliveryAttempt, PublishedEvent, TenantId, Webhook};
use crate::webhooks::resolver::SubscriptionResolver;

pub const TEST_EVENT_TYPE: &str = "webhook.test";

/// Resolves subscribers for one event and dispatches attempt 1 to each of
/// them concurrently.
#[derive(Clone)]
pub struct Fanout {
    resolver: SubscriptionResolver,
    dispatcher: Dispatcher,
    max_concurrency: usize,
}

impl Fanout {
    pub fn new(resolver: SubscriptionResolver, dispatcher: Dispatcher, max_concurrency: usize) -> Self {
        Self {
            resolver,
            dispatcher,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Returns the first attempt created for each subscriber. A failure to
    /// record one webhook's attempt is logged and does not affect the others.
    pub async fn deliver(&self, event: &PublishedEvent) -> anyhow::Result<Vec<DeliveryAttempt>> {
        let webhooks = self
            .resolver
            .resolve(&event.event_type, event.tenant_id)
            .await?;

        if webhooks.is_empty() {
            return Ok(Vec::new());
        }

        // One envelope per event: every subscriber gets the same bytes.
        let envelope = event.envelope();
        let envelope = &envelope;

        let dispatches: Vec<_> = webhooks
            .iter()
            .map(|webhook| async move { (webhook.id, self.dispatcher.dispatch(webhook, envelope).await) }.boxed())
            .collect();
        let results: Vec<_> = stream::iter(dispatches)
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut attempts = Vec::with_capacity(results.len());
        for (webhook_id, result) in results {
            match result {
                Ok(Some(attempt)) => attempts.push(attempt),
                Ok(None) => {}
                Err(e) => tracing::error!(
                    webhook_id = %webhook_id,
                    event_id = %event.event_id,
                    error = %e,
                    "dispatch failed"
                ),
            }
        }

        Ok(attempts)
    }

    /// Send a synthetic `webhook.test` event through the normal path.
    pub async fn send_test(&self, webhook: &Webhook) -> anyhow::Result<Option<DeliveryAttempt>> {
        let event = PublishedEvent::new(
            TEST_EVENT_TYPE,
            format!("test_{}", Uuid::new_v4().simple()),
            webhook.tenant_id,
            json!({
                "message": "This is a test delivery.",
                "webhook_id": webhook.id,
            }),
        );
        self.dispatcher.dispatch(webhook, &event.envelope()).await
    }
}

/// Producer-facing handle. `publish` only enqueues; delivery happens on a
/// background task and its failures never reach the caller.
///
/// The queue is bounded, so a producer outrunning delivery waits for a free
/// slot (never for subscriber I/O). The task returned by [`spawn`] finishes
/// only after every queued event has been fanned out and settled, which is
/// what shutdown waits on.
///
/// [`spawn`]: EventPublisher::spawn
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<PublishedEvent>,
}

impl EventPublisher {
    pub fn spawn(fanout: Fanout, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<PublishedEvent>(capacity.max(1));
        let max_in_flight = fanout.max_concurrency;

        let handle = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();

            while let Some(event) = rx.recv().await {
                while in_flight.len() >= max_in_flight {
                    if let Some(joined) = in_flight.join_next().await {
                        log_join(joined);
                    }
                }

                let fanout = fanout.clone();
                in_flight.spawn(async move {
                    if let Err(e) = fanout.deliver(&event).await {
                        tracing::error!(
                            event_type = %event.event_type,
                            event_id = %event.event_id,
                            error = %e,
                            "event fan-out failed"
                        );
                    }
                });
            }

            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
            tracing::info!("event publisher drained");
        });

        (Self { tx }, handle)
    }

    pub async fn publish(
        &self,
        event_type: impl Into<String>,
        event_id: impl Into<String>,
        data: Value,
        tenant_id: TenantId,
    ) {
        self.publish_event(PublishedEvent::new(event_type, event_id, tenant_id, data))
            .await;
    }

    pub async fn publish_event(&self, event: PublishedEvent) {
        if let Err(e) = self.tx.send(event).await {
            tracing::error!(event_id = %e.0.event_id, "event publisher is closed; event dropped");
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "event fan-out task failed");
    }
}
