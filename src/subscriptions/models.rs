use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::catalog::PlanTier;

/// key: tenant-model -> customer organization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    /// Identity-provider tenant id; the key external events carry.
    pub external_id: String,
    pub name: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Disabled,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for TenantStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "active" => Ok(TenantStatus::Active),
            "disabled" => Ok(TenantStatus::Disabled),
            other => Err(format!("unknown tenant status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    None,
    Trial,
    Active,
    Suspended,
    Cancelled,
}

impl SubscriptionStatus {
    /// Trial and Active are equally entitled; the single predicate the rest
    /// of the engine uses.
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trial)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "none" => Ok(SubscriptionStatus::None),
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

/// Provider status strings map through a fixed table; anything unrecognized
/// returns `None` so an existing row is never clobbered by a status this
/// version does not know about.
pub fn map_provider_status(raw: &str) -> Option<SubscriptionStatus> {
    match raw {
        "active" => Some(SubscriptionStatus::Active),
        "trialing" => Some(SubscriptionStatus::Trial),
        "canceled" => Some(SubscriptionStatus::Cancelled),
        "past_due" | "unpaid" => Some(SubscriptionStatus::Suspended),
        _ => None,
    }
}

/// key: subscription-model -> per-tenant entitlement row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub tier: PlanTier,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub trial_expiry: Option<DateTime<Utc>>,
    pub grace_period_end: Option<DateTime<Utc>>,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_externally_managed(&self) -> bool {
        self.external_subscription_id.is_some()
    }

    pub fn in_grace_period(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Cancelled
            && self.grace_period_end.map_or(false, |end| end > now)
    }
}

/// The row that currently governs the tenant: the entitled (Active/Trial)
/// row with the greatest start date, else a Cancelled row still inside its
/// grace period.
pub fn resolve_current(rows: &[Subscription], now: DateTime<Utc>) -> Option<&Subscription> {
    let entitled = rows
        .iter()
        .filter(|subscription| subscription.status.is_entitled())
        .max_by_key(|subscription| subscription.start_date);
    if entitled.is_some() {
        return entitled;
    }

    rows.iter()
        .filter(|subscription| subscription.in_grace_period(now))
        .max_by_key(|subscription| subscription.start_date)
}

/// Entitlement state the quota governor evaluates against. Tenants with no
/// qualifying row are implicitly on the Starter/None default.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEntitlement {
    pub tier: PlanTier,
    pub status: SubscriptionStatus,
    pub trial_expiry: Option<DateTime<Utc>>,
    pub grace_period_end: Option<DateTime<Utc>>,
    pub subscription_id: Option<Uuid>,
}

impl ResolvedEntitlement {
    pub fn default_starter() -> Self {
        Self {
            tier: PlanTier::Starter,
            status: SubscriptionStatus::None,
            trial_expiry: None,
            grace_period_end: None,
            subscription_id: None,
        }
    }
}

pub fn resolve_entitlement(rows: &[Subscription], now: DateTime<Utc>) -> ResolvedEntitlement {
    match resolve_current(rows, now) {
        Some(subscription) => ResolvedEntitlement {
            tier: subscription.tier,
            status: subscription.status,
            trial_expiry: subscription.trial_expiry,
            grace_period_end: subscription.grace_period_end,
            subscription_id: Some(subscription.id),
        },
        None => ResolvedEntitlement::default_starter(),
    }
}

/// key: ai-usage-ledger -> budgeted counters with lazy calendar reset
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AiUsage {
    pub tenant_id: Uuid,
    pub messages_used: i64,
    pub tokens_used: i64,
    pub last_monthly_reset: DateTime<Utc>,
}

/// Metered resources with maintained counters. Countable ceilings (client
/// spaces, users) are counted from resource rows by their owning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UsageKind {
    Request,
    AiMessage,
    AiTokens,
}
