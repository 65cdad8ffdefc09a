use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::{FeatureFlag, PlanCatalog, PlanDefinition, PlanTier, ResourceKind, UpgradeHint};
use crate::clock::Clock;

use super::models::{
    resolve_entitlement, AiUsage, ResolvedEntitlement, SubscriptionStatus, UsageKind,
};
use super::store::{StoreError, StoreResult, SubscriptionStore};

/// Outcome of a single governance check. Denials always carry the reason,
/// the observed usage, the limit, and an upgrade suggestion.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub resource: String,
    pub used: i64,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub reason: Option<String>,
    pub suggestion: Option<UpgradeHint>,
}

impl QuotaDecision {
    fn allow(resource: impl Into<String>, used: i64, limit: Option<i64>) -> Self {
        Self {
            allowed: true,
            resource: resource.into(),
            used,
            limit,
            remaining: limit.map(|limit| (limit - used).max(0)),
            reason: None,
            suggestion: None,
        }
    }

    fn deny(
        resource: impl Into<String>,
        used: i64,
        limit: i64,
        reason: String,
        suggestion: UpgradeHint,
    ) -> Self {
        Self {
            allowed: false,
            resource: resource.into(),
            used,
            limit: Some(limit),
            remaining: Some((limit - used).max(0)),
            reason: Some(reason),
            suggestion: Some(suggestion),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureDecision {
    pub allowed: bool,
    pub flag: FeatureFlag,
    pub required_tier: Option<PlanTier>,
    pub suggestion: Option<UpgradeHint>,
}

/// Response body for the subscription status query.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatusView {
    pub tier: PlanTier,
    pub status: SubscriptionStatus,
    pub limits: PlanLimitsView,
    pub features: BTreeSet<FeatureFlag>,
    pub trial_expiry: Option<DateTime<Utc>>,
    pub grace_period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanLimitsView {
    pub ceilings: BTreeMap<ResourceKind, Option<i64>>,
    pub max_requests_per_hour: i64,
    pub monthly_token_budget: i64,
}

const RATE_WINDOW_MINUTES: i64 = 60;

/// key: quota-governor -> ceilings,rate,budget,features
///
/// Read-only over subscription state; every check is one store round trip
/// and never touches the external provider.
pub struct QuotaGovernor {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
}

impl QuotaGovernor {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<PlanCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    async fn entitlement(&self, tenant_id: Uuid) -> StoreResult<ResolvedEntitlement> {
        let rows = self.store.list_subscriptions(tenant_id).await?;
        Ok(resolve_entitlement(&rows, self.clock.now()))
    }

    fn plan(&self, tier: PlanTier) -> StoreResult<&PlanDefinition> {
        self.catalog
            .definition(tier)
            .map_err(|err| StoreError::Backend(anyhow::Error::new(err)))
    }

    /// Countable ceiling check. The caller supplies `current_count` and is
    /// responsible for running check-then-create inside one transaction (or
    /// rolling back on post-insert overflow).
    pub async fn check_ceiling(
        &self,
        tenant_id: Uuid,
        kind: ResourceKind,
        current_count: i64,
    ) -> StoreResult<QuotaDecision> {
        let entitlement = self.entitlement(tenant_id).await?;
        let plan = self.plan(entitlement.tier)?;
        match plan.ceiling(kind) {
            None => Ok(QuotaDecision::allow(kind.as_str(), current_count, None)),
            Some(limit) if current_count < limit => {
                Ok(QuotaDecision::allow(kind.as_str(), current_count, Some(limit)))
            }
            Some(limit) => Ok(QuotaDecision::deny(
                kind.as_str(),
                current_count,
                limit,
                format!(
                    "{kind} ceiling of {limit} reached on the {} plan",
                    entitlement.tier
                ),
                entitlement.tier.upgrade_hint(),
            )),
        }
    }

    /// Trailing-window rate limit: no 60-minute span may exceed the plan's
    /// hourly request cap.
    pub async fn check_rate_limit(&self, tenant_id: Uuid) -> StoreResult<QuotaDecision> {
        let entitlement = self.entitlement(tenant_id).await?;
        let plan = self.plan(entitlement.tier)?;
        let since = self.clock.now() - Duration::minutes(RATE_WINDOW_MINUTES);
        let used = self.store.requests_since(tenant_id, since).await?;
        let limit = plan.max_requests_per_hour;
        if used < limit {
            Ok(QuotaDecision::allow("requests-per-hour", used, Some(limit)))
        } else {
            Ok(QuotaDecision::deny(
                "requests-per-hour",
                used,
                limit,
                format!(
                    "rate limit of {limit} requests per hour reached on the {} plan",
                    entitlement.tier
                ),
                entitlement.tier.upgrade_hint(),
            ))
        }
    }

    /// Calendar-month token budget. The stored counter is lazily reset when
    /// the month rolls over, before evaluation; no scheduler is involved.
    /// A budget of 0 disables enforcement for the tier.
    pub async fn check_token_budget(
        &self,
        tenant_id: Uuid,
        requested: i64,
    ) -> StoreResult<QuotaDecision> {
        let entitlement = self.entitlement(tenant_id).await?;
        let plan = self.plan(entitlement.tier)?;
        let usage = self.ai_usage(tenant_id).await?;
        let budget = plan.monthly_token_budget;
        if budget == 0 {
            return Ok(QuotaDecision::allow("ai-tokens", usage.tokens_used, None));
        }
        if usage.tokens_used < budget {
            Ok(QuotaDecision::allow(
                "ai-tokens",
                usage.tokens_used,
                Some(budget),
            ))
        } else {
            Ok(QuotaDecision::deny(
                "ai-tokens",
                usage.tokens_used,
                budget,
                format!(
                    "monthly token budget of {budget} exhausted on the {} plan ({requested} tokens requested)",
                    entitlement.tier
                ),
                entitlement.tier.upgrade_hint(),
            ))
        }
    }

    /// Feature gate. Denials name the minimum tier that grants the flag;
    /// when that tier is Enterprise the suggestion is "contact sales".
    pub async fn check_feature_access(
        &self,
        tenant_id: Uuid,
        flag: FeatureFlag,
    ) -> StoreResult<FeatureDecision> {
        let entitlement = self.entitlement(tenant_id).await?;
        let plan = self.plan(entitlement.tier)?;
        if plan.has_feature(flag) {
            return Ok(FeatureDecision {
                allowed: true,
                flag,
                required_tier: None,
                suggestion: None,
            });
        }
        let required_tier = self.catalog.min_tier_for(flag);
        Ok(FeatureDecision {
            allowed: false,
            flag,
            required_tier,
            suggestion: required_tier.map(PlanTier::hint_for_required),
        })
    }

    /// Post-reset AI counters, so callers can supply the message-ceiling
    /// count without re-implementing the rollover rule.
    pub async fn ai_usage(&self, tenant_id: Uuid) -> StoreResult<AiUsage> {
        let now = self.clock.now();
        match self.store.ai_usage(tenant_id).await? {
            Some(usage) if same_calendar_month(usage.last_monthly_reset, now) => Ok(usage),
            Some(_) => self.store.reset_ai_usage(tenant_id, now).await,
            None => Ok(AiUsage {
                tenant_id,
                messages_used: 0,
                tokens_used: 0,
                last_monthly_reset: now,
            }),
        }
    }

    /// Record consumption for a metered resource. Must run only after the
    /// guarded action succeeded, never before.
    pub async fn record_usage(
        &self,
        tenant_id: Uuid,
        kind: UsageKind,
        amount: i64,
    ) -> StoreResult<()> {
        if amount <= 0 {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "usage amount must be positive"
            )));
        }
        let now = self.clock.now();
        match kind {
            UsageKind::Request => {
                for _ in 0..amount {
                    self.store.record_request(tenant_id, now).await?;
                }
            }
            UsageKind::AiMessage => {
                self.ai_usage(tenant_id).await?;
                self.store.add_ai_usage(tenant_id, amount, 0, now).await?;
            }
            UsageKind::AiTokens => {
                self.ai_usage(tenant_id).await?;
                self.store.add_ai_usage(tenant_id, 0, amount, now).await?;
            }
        }
        Ok(())
    }

    /// The subscription status query: resolved tier/status plus the plan's
    /// limits and features, defaulting to Starter/None.
    pub async fn status_view(&self, tenant_id: Uuid) -> StoreResult<SubscriptionStatusView> {
        let entitlement = self.entitlement(tenant_id).await?;
        let plan = self.plan(entitlement.tier)?;
        Ok(SubscriptionStatusView {
            tier: entitlement.tier,
            status: entitlement.status,
            limits: PlanLimitsView {
                ceilings: plan.ceilings.clone(),
                max_requests_per_hour: plan.max_requests_per_hour,
                monthly_token_budget: plan.monthly_token_budget,
            },
            features: plan.features.clone(),
            trial_expiry: entitlement.trial_expiry,
            grace_period_end: entitlement.grace_period_end,
        })
    }
}

fn same_calendar_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.month() == b.month()
}
