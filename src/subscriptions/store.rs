use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::PlanTier;

use super::models::{AiUsage, Subscription, SubscriptionStatus, Tenant};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("subscription is managed by the external billing provider")]
    ExternallyManaged,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Arguments for the find-or-create path driven by provider events. The
/// external subscription id is the identity: a new id creates a new row, the
/// same id mutates in place.
#[derive(Debug, Clone)]
pub struct UpsertFromExternal {
    pub tenant_id: Uuid,
    pub external_subscription_id: String,
    pub tier: PlanTier,
    /// `None` leaves an existing row's status untouched (unrecognized
    /// provider status); a brand-new row defaults to Active.
    pub status: Option<SubscriptionStatus>,
    pub external_customer_id: Option<String>,
    pub trial_expiry: Option<DateTime<Utc>>,
}

/// key: subscription-store -> narrow repository boundary
///
/// The billing-event processor is the only writer of subscription status and
/// tier outside user-initiated local plan changes; the quota governor reads
/// only.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>>;
    async fn find_tenant_by_external(&self, external_id: &str) -> StoreResult<Option<Tenant>>;
    /// Minimal tenant row for a paid signup that arrived before onboarding.
    async fn create_placeholder_tenant(
        &self,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Tenant>;

    async fn list_subscriptions(&self, tenant_id: Uuid) -> StoreResult<Vec<Subscription>>;
    async fn find_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>>;
    async fn find_by_external_subscription(
        &self,
        external_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>>;

    async fn upsert_from_external(
        &self,
        args: UpsertFromExternal,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription>;
    async fn apply_cancellation(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        grace_days: i64,
    ) -> StoreResult<Subscription>;
    async fn apply_payment_failure(&self, id: Uuid, now: DateTime<Utc>)
        -> StoreResult<Subscription>;
    async fn apply_invoice_paid(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Subscription>;
    /// Local tier change; fails with `ExternallyManaged` when the row has an
    /// external subscription id, so the two systems cannot drift apart.
    async fn change_tier_locally(
        &self,
        id: Uuid,
        new_tier: PlanTier,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription>;

    // Idempotency ledger; written only after a handler completed.
    async fn billing_event_seen(&self, event_id: &str) -> StoreResult<bool>;
    async fn record_billing_event(
        &self,
        event_id: &str,
        event_type: &str,
        processed_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    // Usage counters.
    async fn record_request(&self, tenant_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
    async fn requests_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> StoreResult<i64>;
    async fn ai_usage(&self, tenant_id: Uuid) -> StoreResult<Option<AiUsage>>;
    async fn reset_ai_usage(&self, tenant_id: Uuid, at: DateTime<Utc>) -> StoreResult<AiUsage>;
    async fn add_ai_usage(
        &self,
        tenant_id: Uuid,
        messages: i64,
        tokens: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<AiUsage>;
    /// Drops request-log rows older than `before`; returns how many were
    /// pruned. Advisory maintenance, never a correctness dependency.
    async fn prune_requests(&self, before: DateTime<Utc>) -> StoreResult<u64>;
}
