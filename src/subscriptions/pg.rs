use std::str::FromStr;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::catalog::PlanTier;

use super::models::{AiUsage, Subscription, SubscriptionStatus, Tenant, TenantStatus};
use super::store::{StoreError, StoreResult, SubscriptionStore, UpsertFromExternal};

/// key: subscription-store-pg -> production persistence
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct TenantRow {
    id: Uuid,
    external_id: String,
    name: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = StoreError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        let status = TenantStatus::from_str(&row.status).map_err(|err| anyhow!(err))?;
        Ok(Tenant {
            id: row.id,
            external_id: row.external_id,
            name: row.name,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    tier: String,
    status: String,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    trial_expiry: Option<DateTime<Utc>>,
    grace_period_end: Option<DateTime<Utc>>,
    external_customer_id: Option<String>,
    external_subscription_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let tier = PlanTier::from_str(&row.tier).map_err(|err| anyhow!(err))?;
        let status = SubscriptionStatus::from_str(&row.status).map_err(|err| anyhow!(err))?;
        Ok(Subscription {
            id: row.id,
            tenant_id: row.tenant_id,
            tier,
            status,
            start_date: row.start_date,
            end_date: row.end_date,
            trial_expiry: row.trial_expiry,
            grace_period_end: row.grace_period_end,
            external_customer_id: row.external_customer_id,
            external_subscription_id: row.external_subscription_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err))
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>> {
        let row = sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(Tenant::try_from).transpose()
    }

    async fn find_tenant_by_external(&self, external_id: &str) -> StoreResult<Option<Tenant>> {
        let row = sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(Tenant::try_from).transpose()
    }

    async fn create_placeholder_tenant(
        &self,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Tenant> {
        let row = sqlx::query_as::<_, TenantRow>(
            r#"
            INSERT INTO tenants (id, external_id, name, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'active', $4, $4)
            ON CONFLICT (external_id) DO UPDATE SET updated_at = tenants.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(external_id)
        .bind(format!("pending-{external_id}"))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Tenant::try_from(row)
    }

    async fn list_subscriptions(&self, tenant_id: Uuid) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE tenant_id = $1 ORDER BY start_date DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn find_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(Subscription::try_from).transpose()
    }

    async fn find_by_external_subscription(
        &self,
        external_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE external_subscription_id = $1",
        )
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(Subscription::try_from).transpose()
    }

    async fn upsert_from_external(
        &self,
        args: UpsertFromExternal,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription> {
        let existing_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM subscriptions WHERE tenant_id = $1 AND external_subscription_id = $2",
        )
        .bind(args.tenant_id)
        .bind(&args.external_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let row = match existing_id {
            Some(id) => sqlx::query_as::<_, SubscriptionRow>(
                r#"
                UPDATE subscriptions SET
                    tier = $2,
                    status = COALESCE($3, status),
                    external_customer_id = COALESCE($4, external_customer_id),
                    trial_expiry = COALESCE($5, trial_expiry),
                    updated_at = $6
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(args.tier.as_str())
            .bind(args.status.map(|status| status.as_str()))
            .bind(&args.external_customer_id)
            .bind(args.trial_expiry)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?,
            None => sqlx::query_as::<_, SubscriptionRow>(
                r#"
                INSERT INTO subscriptions (
                    id,
                    tenant_id,
                    tier,
                    status,
                    start_date,
                    trial_expiry,
                    external_customer_id,
                    external_subscription_id,
                    created_at,
                    updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $5, $5)
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(args.tenant_id)
            .bind(args.tier.as_str())
            .bind(
                args.status
                    .unwrap_or(SubscriptionStatus::Active)
                    .as_str(),
            )
            .bind(now)
            .bind(args.trial_expiry)
            .bind(&args.external_customer_id)
            .bind(&args.external_subscription_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?,
        };
        Subscription::try_from(row)
    }

    async fn apply_cancellation(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        grace_days: i64,
    ) -> StoreResult<Subscription> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions SET
                status = 'cancelled',
                end_date = $2,
                grace_period_end = $3,
                updated_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now + Duration::days(grace_days))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or(StoreError::NotFound)?;
        Subscription::try_from(row)
    }

    async fn apply_payment_failure(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "UPDATE subscriptions SET status = 'suspended', updated_at = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or(StoreError::NotFound)?;
        Subscription::try_from(row)
    }

    async fn apply_invoice_paid(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Subscription> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "UPDATE subscriptions SET status = 'active', updated_at = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or(StoreError::NotFound)?;
        Subscription::try_from(row)
    }

    async fn change_tier_locally(
        &self,
        id: Uuid,
        new_tier: PlanTier,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions SET tier = $2, updated_at = $3
            WHERE id = $1 AND external_subscription_id IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new_tier.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => Subscription::try_from(row),
            None => {
                let exists: Option<Uuid> =
                    sqlx::query_scalar("SELECT id FROM subscriptions WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(backend)?;
                if exists.is_some() {
                    Err(StoreError::ExternallyManaged)
                } else {
                    Err(StoreError::NotFound)
                }
            }
        }
    }

    async fn billing_event_seen(&self, event_id: &str) -> StoreResult<bool> {
        let seen: Option<String> =
            sqlx::query_scalar("SELECT event_id FROM billing_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Ok(seen.is_some())
    }

    async fn record_billing_event(
        &self,
        event_id: &str,
        event_type: &str,
        processed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (event_id, event_type, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(processed_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn record_request(&self, tenant_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("INSERT INTO usage_requests (tenant_id, occurred_at) VALUES ($1, $2)")
            .bind(tenant_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn requests_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM usage_requests WHERE tenant_id = $1 AND occurred_at > $2",
        )
        .bind(tenant_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(count)
    }

    async fn ai_usage(&self, tenant_id: Uuid) -> StoreResult<Option<AiUsage>> {
        sqlx::query_as::<_, AiUsage>("SELECT * FROM ai_usage WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)
    }

    async fn reset_ai_usage(&self, tenant_id: Uuid, at: DateTime<Utc>) -> StoreResult<AiUsage> {
        sqlx::query_as::<_, AiUsage>(
            r#"
            INSERT INTO ai_usage (tenant_id, messages_used, tokens_used, last_monthly_reset)
            VALUES ($1, 0, 0, $2)
            ON CONFLICT (tenant_id) DO UPDATE SET
                messages_used = 0,
                tokens_used = 0,
                last_monthly_reset = EXCLUDED.last_monthly_reset
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)
    }

    async fn add_ai_usage(
        &self,
        tenant_id: Uuid,
        messages: i64,
        tokens: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<AiUsage> {
        sqlx::query_as::<_, AiUsage>(
            r#"
            INSERT INTO ai_usage (tenant_id, messages_used, tokens_used, last_monthly_reset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id) DO UPDATE SET
                messages_used = ai_usage.messages_used + EXCLUDED.messages_used,
                tokens_used = ai_usage.tokens_used + EXCLUDED.tokens_used
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(messages)
        .bind(tokens)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)
    }

    async fn prune_requests(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM usage_requests WHERE occurred_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }
}
