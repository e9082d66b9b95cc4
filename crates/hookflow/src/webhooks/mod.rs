pub mod attempts;
pub mod breaker;
pub mod dispatcher;
pub mod engine;
pub mod model;
pub mod publisher;
pub mod repo;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod signer;
pub mod stats;
pub mod worker;

pub use attempts::{AttemptFilter, AttemptsRepo};
pub use breaker::{BreakerState, FailureTracker};
pub use dispatcher::Dispatcher;
pub use engine::Engine;
pub use model::{
    AttemptStatus, DeliveryAttempt, EventEnvelope, NewWebhook, PublishedEvent, TenantId, Webhook,
};
pub use publisher::{EventPublisher, Fanout};
pub use repo::WebhooksRepo;
pub use resolver::SubscriptionResolver;
pub use retry::RetryPolicy;
pub use scheduler::{ClaimedRetry, RetryScheduler};
pub use stats::{DeliveryStats, StatsRepo};
pub use worker::RetryWorker;
