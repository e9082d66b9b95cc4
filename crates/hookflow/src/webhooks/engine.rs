use sqlx::PgPool;

use crate::config::DeliveryConfig;
use crate::webhooks::{
    AttemptsRepo, Dispatcher, FailureTracker, Fanout, RetryScheduler, RetryWorker, StatsRepo,
    SubscriptionResolver, WebhooksRepo,
};

/// All delivery components wired over one pool. The worker binary, the
/// admin API, hookctl and the integration tests build it the same way.
#[derive(Clone)]
pub struct Engine {
    pub webhooks: WebhooksRepo,
    pub attempts: AttemptsRepo,
    pub stats: StatsRepo,
    pub tracker: FailureTracker,
    pub scheduler: RetryScheduler,
    pub dispatcher: Dispatcher,
    pub fanout: Fanout,
    pub retry_worker: RetryWorker,
}

impl Engine {
    pub fn new(pool: PgPool, cfg: DeliveryConfig) -> anyhow::Result<Self> {
        let webhooks = WebhooksRepo::new(pool.clone());
        let attempts = AttemptsRepo::new(pool.clone());
        let stats = StatsRepo::new(pool);

        let tracker = FailureTracker::new(webhooks.clone(), cfg.failure_threshold);
        let scheduler = RetryScheduler::new(
            webhooks.clone(),
            attempts.clone(),
            tracker.clone(),
            cfg.worker_id.clone(),
            cfg.lease_seconds(),
        );
        let dispatcher = Dispatcher::new(
            attempts.clone(),
            scheduler.clone(),
            tracker.clone(),
            cfg.clone(),
        )?;
        let fanout = Fanout::new(
            SubscriptionResolver::new(webhooks.clone()),
            dispatcher.clone(),
            cfg.max_concurrent_deliveries,
        );
        let retry_worker = RetryWorker::new(
            scheduler.clone(),
            dispatcher.clone(),
            cfg.claim_batch_size,
            cfg.max_concurrent_deliveries,
        );

        Ok(Self {
            webhooks,
            attempts,
            stats,
            tracker,
            scheduler,
            dispatcher,
            fanout,
            retry_worker,
        })
    }
}
