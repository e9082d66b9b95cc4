use crate::webhooks::model::{TenantId, Webhook};
use crate::webhooks::repo::WebhooksRepo;

/// Maps an event to the webhooks that should receive it. Never looks
/// outside the event's tenant.
#[derive(Clone)]
pub struct SubscriptionResolver {
    webhooks: WebhooksRepo,
}

impl SubscriptionResolver {
    pub fn new(webhooks: WebhooksRepo) -> Self {
        Self { webhooks }
    }

    pub async fn resolve(
        &self,
        event_type: &str,
        tenant_id: TenantId,
    ) -> anyhow::Result<Vec<Webhook>> {
        let found = self.webhooks.find_subscribed(tenant_id, event_type).await?;
        tracing::debug!(
            event_type,
            tenant_id = %tenant_id,
            subscribers = found.len(),
            "resolved subscribers"
        );
        Ok(found)
    }
}
