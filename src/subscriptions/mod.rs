pub mod adapters;
pub mod api;
pub mod governor;
pub mod maintenance;
pub mod memory;
pub mod models;
pub mod pg;
pub mod processor;
pub mod store;

pub use adapters::{
    BillingInterval, BillingProviderAdapter, CheckoutSession, CheckoutSessionRequest,
    ProviderError, StripeLikeAdapter,
};
pub use governor::{
    FeatureDecision, PlanLimitsView, QuotaDecision, QuotaGovernor, SubscriptionStatusView,
};
pub use memory::MemoryStore;
pub use models::{
    map_provider_status, resolve_current, resolve_entitlement, AiUsage, ResolvedEntitlement,
    Subscription, SubscriptionStatus, Tenant, TenantStatus, UsageKind,
};
pub use pg::PgSubscriptionStore;
pub use processor::{sign_payload, BillingEventProcessor, ProcessError, ProviderEvent};
pub use store::{StoreError, StoreResult, SubscriptionStore, UpsertFromExternal};
