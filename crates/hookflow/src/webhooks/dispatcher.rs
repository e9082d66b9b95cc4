//! One webhook + one event -> one signed HTTP POST -> one recorded attempt.
//!
//! The request body is always the attempt's stored `payload`, so a retry
//! sends the same bytes (and therefore the same signature) as attempt 1.
//! Only `X-Webhook-Delivery-Id` changes between attempts.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::webhooks::attempts::{AttemptsRepo, NewAttempt};
use crate::webhooks::breaker::FailureTracker;
use crate::webhooks::model::{
    AttemptResult, AttemptStatus, DeliveryAttempt, EventEnvelope, Webhook,
};
use crate::webhooks::retry::classify_status;
use crate::webhooks::scheduler::RetryScheduler;
use crate::webhooks::signer;

pub const HEADER_SIGNATURE: &str = "x-webhook-signature";
pub const HEADER_EVENT: &str = "x-webhook-event";
pub const HEADER_DELIVERY_ID: &str = "x-webhook-delivery-id";

/// Headers a custom header may never override.
const PROTECTED_HEADERS: [&str; 4] = [
    "content-type",
    HEADER_SIGNATURE,
    HEADER_EVENT,
    HEADER_DELIVERY_ID,
];

/// Everything needed to put one attempt on the wire.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub result: AttemptResult,
    /// `None` on a 2xx.
    pub error: Option<DeliveryError>,
}

pub fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(concat!("hookflow/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Validate the target, sign the stored payload and assemble headers.
/// Fails before any network I/O.
pub fn build_request(
    webhook: &Webhook,
    attempt: &DeliveryAttempt,
    cfg: &DeliveryConfig,
) -> Result<SignedRequest, DeliveryError> {
    let url = url::Url::parse(&webhook.url)
        .map_err(|e| DeliveryError::Configuration(format!("invalid url {:?}: {e}", webhook.url)))?;

    match url.scheme() {
        "https" => {}
        "http" if cfg.allow_insecure_urls => {}
        other => {
            return Err(DeliveryError::Configuration(format!(
                "webhook url must use https (got {other})"
            )))
        }
    }

    let body = attempt.payload.as_bytes().to_vec();
    let signature = signer::sign(&webhook.secret, &body)?;

    let mut headers = HeaderMap::new();

    for (name, value) in webhook.custom_headers.iter() {
        if is_protected(name) {
            tracing::warn!(
                webhook_id = %webhook.id,
                header = %name,
                "custom header collides with a protected header; ignored"
            );
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => {
                headers.insert(n, v);
            }
            _ => tracing::warn!(
                webhook_id = %webhook.id,
                header = %name,
                "invalid custom header skipped"
            ),
        }
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static(HEADER_SIGNATURE),
        protected_value(&signer::signature_header(&signature))?,
    );
    headers.insert(
        HeaderName::from_static(HEADER_EVENT),
        protected_value(&attempt.event_type)?,
    );
    headers.insert(
        HeaderName::from_static(HEADER_DELIVERY_ID),
        protected_value(&attempt.id.to_string())?,
    );

    Ok(SignedRequest {
        url: url.to_string(),
        headers,
        body,
    })
}

fn is_protected(name: &str) -> bool {
    PROTECTED_HEADERS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(name.trim()))
}

fn protected_value(value: &str) -> Result<HeaderValue, DeliveryError> {
    HeaderValue::from_str(value)
        .map_err(|e| DeliveryError::Configuration(format!("unencodable header value: {e}")))
}

/// POST the request and classify the outcome. Never returns an `Err`:
/// transport failures become a transient [`DeliveryError`].
pub async fn send(client: &reqwest::Client, req: SignedRequest, body_limit: usize) -> SendOutcome {
    let started = Instant::now();

    let sent = client
        .post(&req.url)
        .headers(req.headers)
        .body(req.body)
        .send()
        .await;

    let mut resp = match sent {
        Ok(resp) => resp,
        Err(e) => {
            return SendOutcome {
                result: AttemptResult {
                    http_status: None,
                    response_body: None,
                    elapsed_ms: Some(elapsed_ms(started)),
                },
                error: Some(DeliveryError::from_request(&e)),
            }
        }
    };

    let status = resp.status().as_u16();

    // Read a little past the cap so a multi-byte char at the edge is whole.
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < body_limit + 4 {
        match resp.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(status, error = %e, "response body read failed");
                break;
            }
        }
    }
    buf.truncate(body_limit + 4);
    let body = truncate_body(&String::from_utf8_lossy(&buf), body_limit);

    let result = AttemptResult {
        http_status: Some(i32::from(status)),
        response_body: Some(body),
        elapsed_ms: Some(elapsed_ms(started)),
    };

    let error = match classify_status(status) {
        AttemptStatus::Success => None,
        _ => Some(DeliveryError::http_status(status)),
    };

    SendOutcome { result, error }
}

/// Cut `body` to at most `limit` bytes without splitting a UTF-8 char.
pub fn truncate_body(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

fn elapsed_ms(started: Instant) -> i32 {
    i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX)
}

#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    attempts: AttemptsRepo,
    scheduler: RetryScheduler,
    tracker: FailureTracker,
    cfg: DeliveryConfig,
}

impl Dispatcher {
    pub fn new(
        attempts: AttemptsRepo,
        scheduler: RetryScheduler,
        tracker: FailureTracker,
        cfg: DeliveryConfig,
    ) -> anyhow::Result<Self> {
        let client = build_client(cfg.request_timeout)?;
        Ok(Self {
            client,
            attempts,
            scheduler,
            tracker,
            cfg,
        })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.cfg
    }

    /// First attempt of `envelope` to `webhook`.
    ///
    /// Returns `None` when the webhook is not dispatchable or attempt 1 for
    /// this event already exists (duplicate publish).
    pub async fn dispatch(
        &self,
        webhook: &Webhook,
        envelope: &EventEnvelope,
    ) -> anyhow::Result<Option<DeliveryAttempt>> {
        if !webhook.is_dispatchable() {
            tracing::debug!(webhook_id = %webhook.id, "webhook not dispatchable; skipped");
            return Ok(None);
        }

        let payload = String::from_utf8(envelope.to_bytes()?)?;

        let inserted = self
            .attempts
            .insert_pending(
                &NewAttempt {
                    webhook_id: webhook.id,
                    event_type: &envelope.event_type,
                    event_id: &envelope.event_id,
                    attempt_number: 1,
                    payload: &payload,
                },
                &self.cfg.worker_id,
                self.cfg.lease_seconds(),
            )
            .await?;

        let Some(attempt) = inserted else {
            tracing::debug!(
                webhook_id = %webhook.id,
                event_id = %envelope.event_id,
                "event already delivered to this webhook; skipped"
            );
            return Ok(None);
        };

        self.deliver(webhook, attempt).await.map(Some)
    }

    /// Send one `pending` attempt and record its outcome.
    ///
    /// The lease is renewed first. A claim that sat queued past its lease and
    /// was reaped in the meantime is returned as persisted, without sending.
    pub async fn deliver(
        &self,
        webhook: &Webhook,
        attempt: DeliveryAttempt,
    ) -> anyhow::Result<DeliveryAttempt> {
        let renewed = self
            .attempts
            .renew_lease(attempt.id, &self.cfg.worker_id, self.cfg.lease_seconds())
            .await?;
        let Some(attempt) = renewed else {
            tracing::warn!(
                webhook_id = %webhook.id,
                attempt_id = %attempt.id,
                attempt_number = attempt.attempt_number,
                "lease lost before sending; attempt skipped"
            );
            return Ok(self.attempts.get(attempt.id).await?.unwrap_or(attempt));
        };

        let req = match build_request(webhook, &attempt, &self.cfg) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(
                    webhook_id = %webhook.id,
                    attempt_id = %attempt.id,
                    code = err.code(),
                    error = %err,
                    "delivery rejected before sending"
                );
                let updated = self
                    .attempts
                    .mark_failed_final(attempt.id, &AttemptResult::default(), &err)
                    .await?;
                return self.settled(updated, attempt).await;
            }
        };

        let outcome = send(&self.client, req, self.cfg.response_body_limit).await;

        match outcome.error {
            None => {
                let updated = self.attempts.mark_success(attempt.id, &outcome.result).await?;
                if updated.is_some() {
                    self.tracker.record_success(webhook.id).await?;
                    tracing::info!(
                        webhook_id = %webhook.id,
                        attempt_id = %attempt.id,
                        event_id = %attempt.event_id,
                        attempt_number = attempt.attempt_number,
                        http_status = outcome.result.http_status,
                        elapsed_ms = outcome.result.elapsed_ms,
                        "webhook delivered"
                    );
                }
                self.settled(updated, attempt).await
            }
            Some(err) => {
                let updated = self
                    .scheduler
                    .schedule_retry(&attempt, &webhook.retry_policy(), &outcome.result, &err)
                    .await?;
                self.settled(updated, attempt).await
            }
        }
    }

    /// Attempt as persisted. A `None` update means someone else (the lease
    /// reaper) closed it first; reload what they wrote.
    async fn settled(
        &self,
        updated: Option<DeliveryAttempt>,
        attempt: DeliveryAttempt,
    ) -> anyhow::Result<DeliveryAttempt> {
        if let Some(a) = updated {
            return Ok(a);
        }
        tracing::warn!(
            attempt_id = %attempt.id,
            "attempt was no longer pending when its outcome arrived"
        );
        Ok(self.attempts.get(attempt.id).await?.unwrap_or(attempt))
    }
}
