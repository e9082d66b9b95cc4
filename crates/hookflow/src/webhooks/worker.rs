use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::webhooks::dispatcher::Dispatcher;
use crate::webhooks::scheduler::RetryScheduler;

/// Polls for due retries, claims them and delivers them concurrently.
#[derive(Clone)]
pub struct RetryWorker {
    scheduler: RetryScheduler,
    dispatcher: Dispatcher,
    batch_size: i64,
    max_concurrency: usize,
}

impl RetryWorker {
    pub fn new(
        scheduler: RetryScheduler,
        dispatcher: Dispatcher,
        batch_size: i64,
        max_concurrency: usize,
    ) -> Self {
        Self {
            scheduler,
            dispatcher,
            batch_size: batch_size.max(1),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// One claim + deliver round. Returns the number of retries delivered.
    pub async fn tick(&self) -> anyhow::Result<usize> {
        let claims = self.scheduler.claim_due(self.batch_size).await?;
        if claims.is_empty() {
            return Ok(0);
        }

        let claimed = claims.len();
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = JoinSet::new();

        for claim in claims {
            let dispatcher = self.dispatcher.clone();
            let permits = permits.clone();

            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await?;
                tracing::debug!(
                    webhook_id = %claim.webhook.id,
                    attempt_id = %claim.attempt.id,
                    attempt_number = claim.attempt.attempt_number,
                    "delivering retry"
                );
                dispatcher.deliver(&claim.webhook, claim.attempt).await
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "retry delivery could not be recorded"),
                Err(e) => tracing::error!(error = %e, "retry delivery task failed"),
            }
        }

        Ok(claimed)
    }

    pub async fn reap(&self) -> anyhow::Result<usize> {
        self.scheduler.reap_expired_leases(self.batch_size).await
    }

    /// Loop until `shutdown` flips. Errors are logged and the loop keeps going.
    pub async fn run(
        &self,
        poll_interval: Duration,
        reap_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_reap_at: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_reap_at.map_or(true, |t| t.elapsed() >= reap_interval) {
                if let Err(e) = self.reap().await {
                    tracing::error!(error = %e, "lease reaping failed");
                }
                last_reap_at = Some(Instant::now());
            }

            let idle = match self.tick().await {
                Ok(0) => true,
                Ok(n) => {
                    tracing::debug!(delivered = n, "retry batch finished");
                    false
                }
                Err(e) => {
                    tracing::error!(error = %e, "claiming due retries failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!("retry worker stopped");
    }
}
