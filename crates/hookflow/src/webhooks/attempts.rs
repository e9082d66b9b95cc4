use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::webhooks::model::{AttemptResult, AttemptStatus, DeliveryAttempt, Webhook};

/// Optional filters + cursor for the attempt history listing.
/// Cursor is `(created_at, id)` of the last row seen, ordered DESC.
#[derive(Debug, Clone, Default)]
pub struct AttemptFilter {
    pub status: Option<AttemptStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub cursor_created_at: Option<DateTime<Utc>>,
    pub cursor_id: Option<Uuid>,
}

/// First attempt of a (webhook, event) sequence, or the next one after a
/// claimed retry.
#[derive(Debug, Clone)]
pub struct NewAttempt<'a> {
    pub webhook_id: Uuid,
    pub event_type: &'a str,
    pub event_id: &'a str,
    pub attempt_number: i32,
    pub payload: &'a str,
}

/// What the claim transaction did with one due attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// Attempt N+1 was created, `pending` and leased to the claimer.
    Claimed {
        webhook: Webhook,
        attempt: DeliveryAttempt,
    },
    /// Webhook gone, inactive or disabled; the due attempt is now final.
    Dropped { attempt: DeliveryAttempt },
    /// Policy has no attempts left; the due attempt is now final.
    Exhausted { attempt: DeliveryAttempt },
}

#[derive(Clone)]
pub struct AttemptsRepo {
    pool: PgPool,
}

impl AttemptsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a `pending` attempt leased to `worker_id`.
    ///
    /// Returns `None` when the `(webhook_id, event_id, attempt_number)` row
    /// already exists: a duplicate publish, or another worker got there first.
    pub async fn insert_pending(
        &self,
        new: &NewAttempt<'_>,
        worker_id: &str,
        lease_seconds: i64,
    ) -> anyhow::Result<Option<DeliveryAttempt>> {
        let row = sqlx::query_as::<_, DeliveryAttempt>(INSERT_PENDING_SQL)
            .bind(Uuid::new_v4())
            .bind(new.webhook_id)
            .bind(new.event_type)
            .bind(new.event_id)
            .bind(new.attempt_number)
            .bind(new.payload)
            .bind(worker_id)
            .bind(lease_seconds)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Push the lease forward right before sending. `None` means the attempt
    /// is no longer pending or belongs to someone else, and must not be sent.
    pub async fn renew_lease(
        &self,
        attempt_id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> anyhow::Result<Option<DeliveryAttempt>> {
        let row = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            UPDATE delivery_attempts
            SET lease_expires_at = now() + ($3::bigint * interval '1 second'),
                updated_at = now()
            WHERE id = $1
              AND status = 'pending'
              AND claimed_by = $2
            RETURNING *
            "#,
        )
        .bind(attempt_id)
        .bind(worker_id)
        .bind(lease_seconds)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get(&self, attempt_id: Uuid) -> anyhow::Result<Option<DeliveryAttempt>> {
        let row =
            sqlx::query_as::<_, DeliveryAttempt>("SELECT * FROM delivery_attempts WHERE id = $1")
                .bind(attempt_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    // ----------------------------
    // Terminal / retry transitions (pending only)
    // ----------------------------

    pub async fn mark_success(
        &self,
        attempt_id: Uuid,
        result: &AttemptResult,
    ) -> anyhow::Result<Option<DeliveryAttempt>> {
        let row = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            UPDATE delivery_attempts
            SET status = 'success',
                http_status = $2,
                response_body = $3,
                elapsed_ms = $4,
                error_code = NULL,
                error_message = NULL,
                next_retry_at = NULL,
                delivered_at = now(),
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(attempt_id)
        .bind(result.http_status)
        .bind(result.response_body.as_deref())
        .bind(result.elapsed_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn mark_failed_retryable(
        &self,
        attempt_id: Uuid,
        result: &AttemptResult,
        error: &DeliveryError,
        next_retry_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<DeliveryAttempt>> {
        self.mark_failed(
            attempt_id,
            AttemptStatus::FailedRetryable,
            result,
            error,
            Some(next_retry_at),
        )
        .await
    }

    pub async fn mark_failed_final(
        &self,
        attempt_id: Uuid,
        result: &AttemptResult,
        error: &DeliveryError,
    ) -> anyhow::Result<Option<DeliveryAttempt>> {
        self.mark_failed(attempt_id, AttemptStatus::FailedFinal, result, error, None)
            .await
    }

    async fn mark_failed(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        result: &AttemptResult,
        error: &DeliveryError,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Option<DeliveryAttempt>> {
        let row = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            UPDATE delivery_attempts
            SET status = $2,
                http_status = $3,
                response_body = $4,
                elapsed_ms = $5,
                error_code = $6,
                error_message = $7,
                next_retry_at = $8,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(attempt_id)
        .bind(status.as_str())
        .bind(result.http_status)
        .bind(result.response_body.as_deref())
        .bind(result.elapsed_ms)
        .bind(error.code())
        .bind(error.to_string())
        .bind(next_retry_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ----------------------------
    // Claiming due retries
    // ----------------------------

    /// Claim up to `limit` due `failed_retryable` attempts in one transaction.
    ///
    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED, then `next_retry_at`
    /// is cleared in the same transaction, so a due attempt is handed to
    /// exactly one claimer. The unique key on attempt N+1 backs this up.
    pub async fn claim_due(
        &self,
        worker_id: &str,
        lease_seconds: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<ClaimOutcome>> {
        let limit = limit.clamp(1, 500);
        let mut tx = self.pool.begin().await?;

        let due = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            SELECT *
            FROM delivery_attempts
            WHERE status = 'failed_retryable'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= now()
            ORDER BY next_retry_at ASC, id ASC
            FOR UPDATE SKIP LOCKED
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if due.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = due.iter().map(|a| a.id).collect();
        sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET next_retry_at = NULL,
                updated_at = now()
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        let mut outcomes = Vec::with_capacity(due.len());

        for attempt in due {
            let webhook = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = $1")
                .bind(attempt.webhook_id)
                .fetch_optional(&mut *tx)
                .await?;

            let webhook = match webhook {
                Some(w) if w.is_dispatchable() => w,
                other => {
                    let reason = match other {
                        None => "webhook was deleted",
                        Some(w) if !w.active => "webhook is inactive",
                        Some(_) => "webhook is disabled",
                    };
                    let err = DeliveryError::WebhookUnavailable(reason.to_string());
                    let closed = finalize_due(&mut tx, attempt.id, &err).await?;
                    outcomes.push(ClaimOutcome::Dropped { attempt: closed });
                    continue;
                }
            };

            if attempt.attempt_number >= webhook.retry_policy().max_attempts {
                let err = DeliveryError::ExhaustedRetries {
                    attempts: attempt.attempt_number,
                    last_error: attempt
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                };
                let closed = finalize_due(&mut tx, attempt.id, &err).await?;
                outcomes.push(ClaimOutcome::Exhausted { attempt: closed });
                continue;
            }

            let next = sqlx::query_as::<_, DeliveryAttempt>(INSERT_PENDING_SQL)
                .bind(Uuid::new_v4())
                .bind(attempt.webhook_id)
                .bind(&attempt.event_type)
                .bind(&attempt.event_id)
                .bind(attempt.attempt_number + 1)
                .bind(&attempt.payload)
                .bind(worker_id)
                .bind(lease_seconds)
                .fetch_optional(&mut *tx)
                .await?;

            match next {
                Some(next) => outcomes.push(ClaimOutcome::Claimed {
                    webhook,
                    attempt: next,
                }),
                None => tracing::warn!(
                    attempt_id = %attempt.id,
                    attempt_number = attempt.attempt_number + 1,
                    "next attempt already exists; skipping"
                ),
            }
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    /// Pending attempts whose owner stopped renewing the lease.
    pub async fn find_expired_leases(&self, limit: i64) -> anyhow::Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            SELECT *
            FROM delivery_attempts
            WHERE status = 'pending'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < now()
            ORDER BY lease_expires_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ----------------------------
    // History
    // ----------------------------

    /// Cursor-paginated attempt history for one webhook, newest first.
    /// `limit` is clamped to [1, 500].
    pub async fn list_for_webhook(
        &self,
        webhook_id: Uuid,
        filter: &AttemptFilter,
    ) -> anyhow::Result<Vec<DeliveryAttempt>> {
        let limit = filter.limit.clamp(1, 500);

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM delivery_attempts WHERE webhook_id = ");
        qb.push_bind(webhook_id);

        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND created_at < ").push_bind(until);
        }
        if let (Some(ca), Some(cid)) = (filter.cursor_created_at, filter.cursor_id) {
            qb.push(" AND (created_at, id) < (")
                .push_bind(ca)
                .push(", ")
                .push_bind(cid)
                .push(")");
        }

        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit);

        let rows = qb
            .build_query_as::<DeliveryAttempt>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Every attempt of one (webhook, event) sequence, by attempt number.
    pub async fn list_sequence(
        &self,
        webhook_id: Uuid,
        event_id: &str,
    ) -> anyhow::Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            SELECT *
            FROM delivery_attempts
            WHERE webhook_id = $1 AND event_id = $2
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(webhook_id)
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ----------------------------
    // Gauges
    // ----------------------------

    pub async fn counts_by_status(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM delivery_attempts
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_due(&self) -> anyhow::Result<i64> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM delivery_attempts
            WHERE status = 'failed_retryable'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= now()
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }
}

const INSERT_PENDING_SQL: &str = r#"
    INSERT INTO delivery_attempts
        (id, webhook_id, event_type, event_id, attempt_number, payload,
         status, claimed_by, lease_expires_at)
    VALUES
        ($1, $2, $3, $4, $5, $6,
         'pending', $7, now() + ($8::bigint * interval '1 second'))
    ON CONFLICT (webhook_id, event_id, attempt_number) DO NOTHING
    RETURNING *
"#;

async fn finalize_due(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    attempt_id: Uuid,
    error: &DeliveryError,
) -> anyhow::Result<DeliveryAttempt> {
    let row = sqlx::query_as::<_, DeliveryAttempt>(
        r#"
        UPDATE delivery_attempts
        SET status = 'failed_final',
            error_code = $2,
            error_message = $3,
            next_retry_at = NULL,
            updated_at = now()
        WHERE id = $1 AND status = 'failed_retryable'
        RETURNING *
        "#,
    )
    .bind(attempt_id)
    .bind(error.code())
    .bind(error.to_string())
    .fetch_one(&mut **tx)
    .await?;
    Ok(row)
}
