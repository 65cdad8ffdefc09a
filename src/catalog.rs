use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// key: plan-catalog -> tiers,limits,features
///
/// The one totally-ordered tier enum; every tier comparison in the codebase
/// goes through `Ord` on this type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Starter,
    Professional,
    Business,
    Enterprise,
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [
        PlanTier::Starter,
        PlanTier::Professional,
        PlanTier::Business,
        PlanTier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Professional => "professional",
            PlanTier::Business => "business",
            PlanTier::Enterprise => "enterprise",
        }
    }

    /// The tier strictly above this one, if any.
    pub fn next(&self) -> Option<PlanTier> {
        match self {
            PlanTier::Starter => Some(PlanTier::Professional),
            PlanTier::Professional => Some(PlanTier::Business),
            PlanTier::Business => Some(PlanTier::Enterprise),
            PlanTier::Enterprise => None,
        }
    }

    /// What a denial should suggest. Enterprise is never a self-serve
    /// upgrade target.
    pub fn upgrade_hint(&self) -> UpgradeHint {
        match self.next() {
            Some(PlanTier::Enterprise) => UpgradeHint::ContactSales,
            Some(tier) => UpgradeHint::Upgrade { tier },
            None => UpgradeHint::AlreadyTop,
        }
    }

    /// Hint for a denial that requires a specific tier.
    pub fn hint_for_required(required: PlanTier) -> UpgradeHint {
        if required == PlanTier::Enterprise {
            UpgradeHint::ContactSales
        } else {
            UpgradeHint::Upgrade { tier: required }
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = UnknownTier;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "starter" => Ok(PlanTier::Starter),
            "professional" => Ok(PlanTier::Professional),
            "business" => Ok(PlanTier::Business),
            "enterprise" => Ok(PlanTier::Enterprise),
            _ => Err(UnknownTier(raw.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown plan tier: {0}")]
pub struct UnknownTier(pub String);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    ClientSpaces,
    Users,
    AiMessages,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ClientSpaces => "client-spaces",
            ResourceKind::Users => "users",
            ResourceKind::AiMessages => "ai-messages",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureFlag {
    ApiAccess,
    PrioritySupport,
    CustomBranding,
    CrossTenantSearch,
    SingleSignOn,
}

impl FeatureFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureFlag::ApiAccess => "api-access",
            FeatureFlag::PrioritySupport => "priority-support",
            FeatureFlag::CustomBranding => "custom-branding",
            FeatureFlag::CrossTenantSearch => "cross-tenant-search",
            FeatureFlag::SingleSignOn => "single-sign-on",
        }
    }
}

impl fmt::Display for FeatureFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Suggested remediation attached to every denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum UpgradeHint {
    Upgrade { tier: PlanTier },
    ContactSales,
    AlreadyTop,
}

/// Per-tier limits and capabilities. `None` in the ceilings map is the
/// unlimited sentinel; `monthly_token_budget == 0` disables budget
/// enforcement for that tier.
#[derive(Debug, Clone, Serialize)]
pub struct PlanDefinition {
    pub tier: PlanTier,
    pub ceilings: BTreeMap<ResourceKind, Option<i64>>,
    pub max_requests_per_hour: i64,
    pub monthly_token_budget: i64,
    pub features: BTreeSet<FeatureFlag>,
}

impl PlanDefinition {
    pub fn ceiling(&self, kind: ResourceKind) -> Option<i64> {
        self.ceilings.get(&kind).copied().flatten()
    }

    pub fn has_feature(&self, flag: FeatureFlag) -> bool {
        self.features.contains(&flag)
    }
}

/// key: plan-catalog-registry -> static, read-only after construction
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: BTreeMap<PlanTier, PlanDefinition>,
}

impl PlanCatalog {
    pub fn new(definitions: Vec<PlanDefinition>) -> Self {
        let plans = definitions
            .into_iter()
            .map(|definition| (definition.tier, definition))
            .collect();
        Self { plans }
    }

    pub fn definition(&self, tier: PlanTier) -> Result<&PlanDefinition, UnknownTier> {
        self.plans
            .get(&tier)
            .ok_or_else(|| UnknownTier(tier.as_str().to_string()))
    }

    /// Tiers ordered ascending. Enterprise is excluded from self-serve
    /// listings unless explicitly requested.
    pub fn list_available(&self, include_enterprise: bool) -> Vec<&PlanDefinition> {
        self.plans
            .values()
            .filter(|definition| include_enterprise || definition.tier != PlanTier::Enterprise)
            .collect()
    }

    /// Lowest tier whose feature set grants `flag`.
    pub fn min_tier_for(&self, flag: FeatureFlag) -> Option<PlanTier> {
        self.plans
            .values()
            .find(|definition| definition.has_feature(flag))
            .map(|definition| definition.tier)
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let starter = PlanDefinition {
            tier: PlanTier::Starter,
            ceilings: BTreeMap::from([
                (ResourceKind::ClientSpaces, Some(5)),
                (ResourceKind::Users, Some(5)),
                (ResourceKind::AiMessages, Some(100)),
            ]),
            max_requests_per_hour: 60,
            monthly_token_budget: 100_000,
            features: BTreeSet::new(),
        };
        let professional = PlanDefinition {
            tier: PlanTier::Professional,
            ceilings: BTreeMap::from([
                (ResourceKind::ClientSpaces, Some(25)),
                (ResourceKind::Users, Some(25)),
                (ResourceKind::AiMessages, Some(1_000)),
            ]),
            max_requests_per_hour: 300,
            monthly_token_budget: 1_000_000,
            features: BTreeSet::from([FeatureFlag::ApiAccess, FeatureFlag::PrioritySupport]),
        };
        let business = PlanDefinition {
            tier: PlanTier::Business,
            ceilings: BTreeMap::from([
                (ResourceKind::ClientSpaces, Some(100)),
                (ResourceKind::Users, Some(100)),
                (ResourceKind::AiMessages, Some(5_000)),
            ]),
            max_requests_per_hour: 1_000,
            monthly_token_budget: 5_000_000,
            features: BTreeSet::from([
                FeatureFlag::ApiAccess,
                FeatureFlag::PrioritySupport,
                FeatureFlag::CustomBranding,
                FeatureFlag::CrossTenantSearch,
            ]),
        };
        let enterprise = PlanDefinition {
            tier: PlanTier::Enterprise,
            ceilings: BTreeMap::from([
                (ResourceKind::ClientSpaces, None),
                (ResourceKind::Users, None),
                (ResourceKind::AiMessages, None),
            ]),
            max_requests_per_hour: 10_000,
            monthly_token_budget: 0,
            features: BTreeSet::from([
                FeatureFlag::ApiAccess,
                FeatureFlag::PrioritySupport,
                FeatureFlag::CustomBranding,
                FeatureFlag::CrossTenantSearch,
                FeatureFlag::SingleSignOn,
            ]),
        };
        Self::new(vec![starter, professional, business, enterprise])
    }
}
