use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::catalog::PlanTier;

use super::models::{AiUsage, Subscription, SubscriptionStatus, Tenant, TenantStatus};
use super::store::{StoreError, StoreResult, SubscriptionStore, UpsertFromExternal};

/// In-process store backing the deterministic test suite and local
/// development. Mirrors the Postgres store's semantics exactly.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tenants: HashMap<Uuid, Tenant>,
    subscriptions: HashMap<Uuid, Subscription>,
    billing_events: HashMap<String, (String, DateTime<Utc>)>,
    request_log: HashMap<Uuid, Vec<DateTime<Utc>>>,
    ai_usage: HashMap<Uuid, AiUsage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed helper for tests and local bootstrap.
    pub fn insert_tenant(&self, tenant: Tenant) {
        self.inner
            .lock()
            .unwrap()
            .tenants
            .insert(tenant.id, tenant);
    }

    /// Seed helper for tests and local bootstrap.
    pub fn insert_subscription(&self, subscription: Subscription) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub fn billing_event_count(&self) -> usize {
        self.inner.lock().unwrap().billing_events.len()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn find_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>> {
        Ok(self.inner.lock().unwrap().tenants.get(&tenant_id).cloned())
    }

    async fn find_tenant_by_external(&self, external_id: &str) -> StoreResult<Option<Tenant>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tenants
            .values()
            .find(|tenant| tenant.external_id == external_id)
            .cloned())
    }

    async fn create_placeholder_tenant(
        &self,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Tenant> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .tenants
            .values()
            .find(|tenant| tenant.external_id == external_id)
        {
            return Ok(existing.clone());
        }
        let tenant = Tenant {
            id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            name: format!("pending-{external_id}"),
            status: TenantStatus::Active,
            created_at: now,
            updated_at: now,
        };
        inner.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn list_subscriptions(&self, tenant_id: Uuid) -> StoreResult<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|subscription| subscription.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn find_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>> {
        Ok(self.inner.lock().unwrap().subscriptions.get(&id).cloned())
    }

    async fn find_by_external_subscription(
        &self,
        external_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .find(|subscription| {
                subscription.external_subscription_id.as_deref() == Some(external_subscription_id)
            })
            .cloned())
    }

    async fn upsert_from_external(
        &self,
        args: UpsertFromExternal,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription> {
        let mut inner = self.inner.lock().unwrap();
        let existing_id = inner
            .subscriptions
            .values()
            .find(|subscription| {
                subscription.tenant_id == args.tenant_id
                    && subscription.external_subscription_id.as_deref()
                        == Some(args.external_subscription_id.as_str())
            })
            .map(|subscription| subscription.id);

        match existing_id {
            Some(id) => {
                let subscription = inner.subscriptions.get_mut(&id).unwrap();
                subscription.tier = args.tier;
                if let Some(status) = args.status {
                    subscription.status = status;
                }
                if args.external_customer_id.is_some() {
                    subscription.external_customer_id = args.external_customer_id;
                }
                if args.trial_expiry.is_some() {
                    subscription.trial_expiry = args.trial_expiry;
                }
                subscription.updated_at = now;
                Ok(subscription.clone())
            }
            None => {
                let subscription = Subscription {
                    id: Uuid::new_v4(),
                    tenant_id: args.tenant_id,
                    tier: args.tier,
                    status: args.status.unwrap_or(SubscriptionStatus::Active),
                    start_date: now,
                    end_date: None,
                    trial_expiry: args.trial_expiry,
                    grace_period_end: None,
                    external_customer_id: args.external_customer_id,
                    external_subscription_id: Some(args.external_subscription_id),
                    created_at: now,
                    updated_at: now,
                };
                inner
                    .subscriptions
                    .insert(subscription.id, subscription.clone());
                Ok(subscription)
            }
        }
    }

    async fn apply_cancellation(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        grace_days: i64,
    ) -> StoreResult<Subscription> {
        let mut inner = self.inner.lock().unwrap();
        let subscription = inner.subscriptions.get_mut(&id).ok_or(StoreError::NotFound)?;
        subscription.status = SubscriptionStatus::Cancelled;
        subscription.end_date = Some(now);
        subscription.grace_period_end = Some(now + Duration::days(grace_days));
        subscription.updated_at = now;
        Ok(subscription.clone())
    }

    async fn apply_payment_failure(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription> {
        let mut inner = self.inner.lock().unwrap();
        let subscription = inner.subscriptions.get_mut(&id).ok_or(StoreError::NotFound)?;
        subscription.status = SubscriptionStatus::Suspended;
        subscription.updated_at = now;
        Ok(subscription.clone())
    }

    async fn apply_invoice_paid(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Subscription> {
        let mut inner = self.inner.lock().unwrap();
        let subscription = inner.subscriptions.get_mut(&id).ok_or(StoreError::NotFound)?;
        subscription.status = SubscriptionStatus::Active;
        subscription.updated_at = now;
        Ok(subscription.clone())
    }

    async fn change_tier_locally(
        &self,
        id: Uuid,
        new_tier: PlanTier,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription> {
        let mut inner = self.inner.lock().unwrap();
        let subscription = inner.subscriptions.get_mut(&id).ok_or(StoreError::NotFound)?;
        if subscription.external_subscription_id.is_some() {
            return Err(StoreError::ExternallyManaged);
        }
        subscription.tier = new_tier;
        subscription.updated_at = now;
        Ok(subscription.clone())
    }

    async fn billing_event_seen(&self, event_id: &str) -> StoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .billing_events
            .contains_key(event_id))
    }

    async fn record_billing_event(
        &self,
        event_id: &str,
        event_type: &str,
        processed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .billing_events
            .insert(event_id.to_string(), (event_type.to_string(), processed_at));
        Ok(())
    }

    async fn record_request(&self, tenant_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .request_log
            .entry(tenant_id)
            .or_default()
            .push(at);
        Ok(())
    }

    async fn requests_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> StoreResult<i64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .request_log
            .get(&tenant_id)
            .map(|log| log.iter().filter(|at| **at > since).count() as i64)
            .unwrap_or(0))
    }

    async fn ai_usage(&self, tenant_id: Uuid) -> StoreResult<Option<AiUsage>> {
        Ok(self.inner.lock().unwrap().ai_usage.get(&tenant_id).cloned())
    }

    async fn reset_ai_usage(&self, tenant_id: Uuid, at: DateTime<Utc>) -> StoreResult<AiUsage> {
        let usage = AiUsage {
            tenant_id,
            messages_used: 0,
            tokens_used: 0,
            last_monthly_reset: at,
        };
        self.inner
            .lock()
            .unwrap()
            .ai_usage
            .insert(tenant_id, usage.clone());
        Ok(usage)
    }

    async fn add_ai_usage(
        &self,
        tenant_id: Uuid,
        messages: i64,
        tokens: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<AiUsage> {
        let mut inner = self.inner.lock().unwrap();
        let usage = inner.ai_usage.entry(tenant_id).or_insert_with(|| AiUsage {
            tenant_id,
            messages_used: 0,
            tokens_used: 0,
            last_monthly_reset: at,
        });
        usage.messages_used += messages;
        usage.tokens_used += tokens;
        Ok(usage.clone())
    }

    async fn prune_requests(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut pruned = 0u64;
        for log in inner.request_log.values_mut() {
            let initial = log.len();
            log.retain(|at| *at >= before);
            pruned += (initial - log.len()) as u64;
        }
        Ok(pruned)
    }
}
