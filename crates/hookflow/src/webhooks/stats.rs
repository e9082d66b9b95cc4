use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub webhook_id: Uuid,
    pub window_days: i64,
    pub total: i64,
    pub successful: i64,
    /// `failed_retryable` + `failed_final`.
    pub failed: i64,
    pub pending: i64,
    /// 0.0..=1.0
    pub success_rate: f64,
    pub avg_response_ms: Option<f64>,
}

pub fn success_rate(successful: i64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        successful as f64 / total as f64
    }
}

#[derive(Clone)]
pub struct StatsRepo {
    pool: PgPool,
}

impl StatsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Rolling stats over attempts created in the last `window_days`.
    pub async fn for_webhook(&self, webhook_id: Uuid, window_days: i64) -> anyhow::Result<DeliveryStats> {
        let window_days = window_days.clamp(1, 3650);

        let (total, successful, failed, pending, avg_response_ms) =
            sqlx::query_as::<_, (i64, i64, i64, i64, Option<f64>)>(
                r#"
                SELECT
                    COUNT(*),
                    COUNT(*) FILTER (WHERE status = 'success'),
                    COUNT(*) FILTER (WHERE status IN ('failed_retryable', 'failed_final')),
                    COUNT(*) FILTER (WHERE status = 'pending'),
                    AVG(elapsed_ms)::float8
                FROM delivery_attempts
                WHERE webhook_id = $1
                  AND created_at >= now() - ($2::bigint * interval '1 day')
                "#,
            )
            .bind(webhook_id)
            .bind(window_days)
            .fetch_one(&self.pool)
            .await?;

        Ok(DeliveryStats {
            webhook_id,
            window_days,
            total,
            successful,
            failed,
            pending,
            success_rate: success_rate(successful, total),
            avg_response_ms,
        })
    }
}
