use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::webhooks::repo::WebhooksRepo;

pub const DEFAULT_FAILURE_THRESHOLD: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Active { failures: i32 },
    Disabled { failures: i32, disabled_at: DateTime<Utc> },
}

impl BreakerState {
    pub fn failures(&self) -> i32 {
        match self {
            BreakerState::Active { failures } | BreakerState::Disabled { failures, .. } => {
                *failures
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, BreakerState::Disabled { .. })
    }
}

/// Per-webhook consecutive failure counter. Only sequences that end in
/// `failed_final` after exhausting retries count; a success resets.
#[derive(Clone)]
pub struct FailureTracker {
    webhooks: WebhooksRepo,
    threshold: i32,
}

impl FailureTracker {
    pub fn new(webhooks: WebhooksRepo, threshold: i32) -> Self {
        Self {
            webhooks,
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    pub async fn record_final_failure(
        &self,
        webhook_id: Uuid,
    ) -> anyhow::Result<Option<BreakerState>> {
        let Some((failures, disabled_at)) = self
            .webhooks
            .increment_failures(webhook_id, self.threshold)
            .await?
        else {
            return Ok(None);
        };

        let state = match disabled_at {
            Some(disabled_at) => BreakerState::Disabled {
                failures,
                disabled_at,
            },
            None => BreakerState::Active { failures },
        };

        if failures == self.threshold && state.is_disabled() {
            tracing::warn!(
                webhook_id = %webhook_id,
                failures,
                threshold = self.threshold,
                "webhook disabled after consecutive failures"
            );
        } else {
            tracing::debug!(webhook_id = %webhook_id, failures, "webhook failure recorded");
        }

        Ok(Some(state))
    }

    pub async fn record_success(&self, webhook_id: Uuid) -> anyhow::Result<()> {
        self.webhooks.reset_failures(webhook_id).await
    }
}
