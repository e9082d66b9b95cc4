use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::webhooks::model::{NewWebhook, TenantId, Webhook};

#[derive(Clone)]
pub struct WebhooksRepo {
    pool: PgPool,
}

impl WebhooksRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ----------------------------
    // Seeding
    // ----------------------------

    pub async fn insert(&self, webhook: NewWebhook) -> anyhow::Result<Webhook> {
        let row = sqlx::query_as::<_, Webhook>(
            r#"
            INSERT INTO webhooks
                (tenant_id, url, event_types, secret, custom_headers, max_attempts, backoff_seconds)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(webhook.tenant_id)
        .bind(&webhook.url)
        .bind(&webhook.event_types)
        .bind(&webhook.secret)
        .bind(Json(&webhook.custom_headers))
        .bind(webhook.max_attempts)
        .bind(&webhook.backoff_seconds)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get(&self, webhook_id: Uuid) -> anyhow::Result<Option<Webhook>> {
        let row = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = $1")
            .bind(webhook_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Dispatchable webhooks of one tenant subscribed to `event_type`.
    pub async fn find_subscribed(
        &self,
        tenant_id: TenantId,
        event_type: &str,
    ) -> anyhow::Result<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT *
            FROM webhooks
            WHERE tenant_id = $1
              AND active
              AND disabled_at IS NULL
              AND $2 = ANY(event_types)
            "#,
        )
        .bind(tenant_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn count_disabled(&self) -> anyhow::Result<i64> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM webhooks WHERE disabled_at IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(n)
    }

    // ----------------------------
    // Health counters
    // ----------------------------

    /// One atomic bump of the failure counter. Trips `disabled_at` the first
    /// time the new count reaches `threshold`. Returns the post-update
    /// `(consecutive_failure_count, disabled_at)`, or `None` when the webhook
    /// no longer exists.
    pub async fn increment_failures(
        &self,
        webhook_id: Uuid,
        threshold: i32,
    ) -> anyhow::Result<Option<(i32, Option<DateTime<Utc>>)>> {
        let row = sqlx::query_as::<_, (i32, Option<DateTime<Utc>>)>(
            r#"
            UPDATE webhooks
            SET consecutive_failure_count = consecutive_failure_count + 1,
                disabled_at = CASE
                    WHEN disabled_at IS NULL AND consecutive_failure_count + 1 >= $2 THEN now()
                    ELSE disabled_at
                END,
                updated_at = now()
            WHERE id = $1
            RETURNING consecutive_failure_count, disabled_at
            "#,
        )
        .bind(webhook_id)
        .bind(threshold)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Success resets the counter. `disabled_at` is left alone: reactivation
    /// is an operator action.
    pub async fn reset_failures(&self, webhook_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE webhooks
            SET consecutive_failure_count = 0,
                last_triggered_at = now(),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(webhook_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Operator reactivation: clears the breaker and the counter together.
    pub async fn reactivate(&self, webhook_id: Uuid) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE webhooks
            SET disabled_at = NULL,
                consecutive_failure_count = 0,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(webhook_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}
