use chrono::Utc;

use crate::error::DeliveryError;
use crate::webhooks::attempts::{AttemptsRepo, ClaimOutcome};
use crate::webhooks::breaker::FailureTracker;
use crate::webhooks::model::{AttemptResult, DeliveryAttempt, Webhook};
use crate::webhooks::repo::WebhooksRepo;
use crate::webhooks::retry::RetryPolicy;

/// A due retry this worker now owns: attempt N+1, `pending`, leased.
#[derive(Debug, Clone)]
pub struct ClaimedRetry {
    pub webhook: Webhook,
    pub attempt: DeliveryAttempt,
}

#[derive(Clone)]
pub struct RetryScheduler {
    webhooks: WebhooksRepo,
    attempts: AttemptsRepo,
    tracker: FailureTracker,
    worker_id: String,
    lease_seconds: i64,
}

impl RetryScheduler {
    pub fn new(
        webhooks: WebhooksRepo,
        attempts: AttemptsRepo,
        tracker: FailureTracker,
        worker_id: impl Into<String>,
        lease_seconds: i64,
    ) -> Self {
        Self {
            webhooks,
            attempts,
            tracker,
            worker_id: worker_id.into(),
            lease_seconds,
        }
    }

    /// Close out a failed pending attempt: `failed_retryable` with a due time
    /// while the policy has attempts left, otherwise `failed_final`.
    ///
    /// Only exhausted retryable failures reach the failure tracker. Returns
    /// `None` if the attempt was no longer pending.
    pub async fn schedule_retry(
        &self,
        attempt: &DeliveryAttempt,
        policy: &RetryPolicy,
        result: &AttemptResult,
        error: &DeliveryError,
    ) -> anyhow::Result<Option<DeliveryAttempt>> {
        if !error.is_retryable() {
            return self.attempts.mark_failed_final(attempt.id, result, error).await;
        }

        if let Some(next_retry_at) = policy.next_retry_at(attempt.attempt_number, Utc::now()) {
            let updated = self
                .attempts
                .mark_failed_retryable(attempt.id, result, error, next_retry_at)
                .await?;

            if updated.is_some() {
                tracing::info!(
                    webhook_id = %attempt.webhook_id,
                    attempt_id = %attempt.id,
                    event_id = %attempt.event_id,
                    attempt_number = attempt.attempt_number,
                    next_retry_at = %next_retry_at,
                    error = %error,
                    "delivery failed; retry scheduled"
                );
            }
            return Ok(updated);
        }

        let exhausted = DeliveryError::ExhaustedRetries {
            attempts: attempt.attempt_number,
            last_error: error.to_string(),
        };
        let updated = self
            .attempts
            .mark_failed_final(attempt.id, result, &exhausted)
            .await?;

        if updated.is_some() {
            tracing::warn!(
                webhook_id = %attempt.webhook_id,
                attempt_id = %attempt.id,
                event_id = %attempt.event_id,
                attempt_number = attempt.attempt_number,
                error = %error,
                "delivery failed; retries exhausted"
            );
            self.tracker.record_final_failure(attempt.webhook_id).await?;
        }

        Ok(updated)
    }

    /// Claim due retries for this worker. Exhausted and dropped sequences are
    /// finalized inside the claim; only live claims are returned.
    pub async fn claim_due(&self, limit: i64) -> anyhow::Result<Vec<ClaimedRetry>> {
        let outcomes = self
            .attempts
            .claim_due(&self.worker_id, self.lease_seconds, limit)
            .await?;

        let mut claimed = Vec::with_capacity(outcomes.len());

        for outcome in outcomes {
            match outcome {
                ClaimOutcome::Claimed { webhook, attempt } => {
                    claimed.push(ClaimedRetry { webhook, attempt });
                }
                ClaimOutcome::Exhausted { attempt } => {
                    tracing::warn!(
                        webhook_id = %attempt.webhook_id,
                        attempt_id = %attempt.id,
                        attempt_number = attempt.attempt_number,
                        "retry policy exhausted at claim"
                    );
                    self.tracker.record_final_failure(attempt.webhook_id).await?;
                }
                ClaimOutcome::Dropped { attempt } => {
                    tracing::info!(
                        webhook_id = %attempt.webhook_id,
                        attempt_id = %attempt.id,
                        event_id = %attempt.event_id,
                        reason = attempt.error_message.as_deref().unwrap_or(""),
                        "retry dropped"
                    );
                }
            }
        }

        Ok(claimed)
    }

    /// Treat pending attempts with an expired lease as transient failures.
    /// Returns how many were closed out.
    pub async fn reap_expired_leases(&self, limit: i64) -> anyhow::Result<usize> {
        let expired = self.attempts.find_expired_leases(limit).await?;
        let mut reaped = 0;

        for attempt in expired {
            let err = DeliveryError::lease_expired(attempt.claimed_by.as_deref());

            let policy = match self.webhooks.get(attempt.webhook_id).await? {
                Some(webhook) => webhook.retry_policy(),
                None => {
                    let gone = DeliveryError::WebhookUnavailable("webhook was deleted".into());
                    if self
                        .attempts
                        .mark_failed_final(attempt.id, &AttemptResult::default(), &gone)
                        .await?
                        .is_some()
                    {
                        reaped += 1;
                    }
                    continue;
                }
            };

            if self
                .schedule_retry(&attempt, &policy, &AttemptResult::default(), &err)
                .await?
                .is_some()
            {
                reaped += 1;
            }
        }

        if reaped > 0 {
            tracing::info!(reaped, "expired leases reaped");
        }
        Ok(reaped)
    }
}
