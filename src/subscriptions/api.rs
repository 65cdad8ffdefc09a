use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::catalog::{
    FeatureFlag, PlanCatalog, PlanDefinition, PlanTier, ResourceKind, UpgradeHint,
};
use crate::clock::Clock;
use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::TenantContext;

use super::adapters::{BillingInterval, BillingProviderAdapter, CheckoutSession, CheckoutSessionRequest};
use super::governor::{FeatureDecision, QuotaDecision, QuotaGovernor, SubscriptionStatusView};
use super::models::{resolve_current, AiUsage, Subscription, UsageKind};
use super::processor::{BillingEventProcessor, ProcessError};
use super::store::{StoreError, SubscriptionStore};

fn store_error(err: StoreError) -> AppError {
    match err {
        StoreError::NotFound => AppError::NotFound("subscription"),
        StoreError::ExternallyManaged => AppError::UseExternalCheckout,
        StoreError::Backend(source) => AppError::storage(source),
    }
}

/// Webhook failures must keep their spec'd status codes: 400 rejects are
/// never recorded, 500s trigger provider redelivery.
fn process_error(err: ProcessError) -> AppError {
    match err {
        ProcessError::SignatureInvalid => AppError::SignatureInvalid,
        ProcessError::Malformed(message) => AppError::Validation(message),
        ProcessError::Store(StoreError::Backend(source)) => AppError::storage(source),
        ProcessError::Store(other) => AppError::storage(anyhow::Error::new(other)),
    }
}

/// key: billing-webhook -> provider entrypoint
pub async fn billing_webhook(
    Extension(processor): Extension<Arc<BillingEventProcessor>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let signature = headers.get("signature").and_then(|value| value.to_str().ok());
    let event = processor.verify(&body, signature).map_err(process_error)?;
    processor.process(&event).await.map_err(process_error)?;
    Ok(Json(json!({ "received": true })))
}

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub target_tier: String,
    pub billing_interval: BillingInterval,
    pub success_url: String,
    pub cancel_url: String,
}

pub async fn create_checkout_session(
    Extension(store): Extension<Arc<dyn SubscriptionStore>>,
    Extension(adapter): Extension<Arc<dyn BillingProviderAdapter>>,
    context: TenantContext,
    Json(payload): Json<CreateCheckoutRequest>,
) -> AppResult<Json<CheckoutSession>> {
    let tier: PlanTier = payload
        .target_tier
        .parse()
        .map_err(|_| AppError::Validation(format!("unknown tier: {}", payload.target_tier)))?;
    if tier == PlanTier::Enterprise {
        return Err(AppError::Validation(
            "enterprise plans are not self-serve; contact sales".into(),
        ));
    }
    for (name, raw) in [
        ("success_url", &payload.success_url),
        ("cancel_url", &payload.cancel_url),
    ] {
        Url::parse(raw).map_err(|_| AppError::Validation(format!("invalid {name}")))?;
    }

    let tenant = store
        .find_tenant(context.tenant_id)
        .await
        .map_err(store_error)?
        .ok_or(AppError::NotFound("tenant"))?;

    let session = adapter
        .create_checkout_session(&CheckoutSessionRequest {
            tenant_id: tenant.id,
            tenant_external_id: tenant.external_id,
            target_tier: tier,
            billing_interval: payload.billing_interval,
            success_url: payload.success_url,
            cancel_url: payload.cancel_url,
        })
        .await
        .map_err(|err| AppError::Provider(err.to_string()))?;
    Ok(Json(session))
}

pub async fn get_subscription(
    Extension(governor): Extension<Arc<QuotaGovernor>>,
    context: TenantContext,
) -> AppResult<Json<SubscriptionStatusView>> {
    let view = governor
        .status_view(context.tenant_id)
        .await
        .map_err(store_error)?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct ListPlansQuery {
    #[serde(default)]
    pub include_enterprise: bool,
}

pub async fn list_plans(
    Extension(catalog): Extension<Arc<PlanCatalog>>,
    Query(query): Query<ListPlansQuery>,
) -> Json<Vec<PlanDefinition>> {
    let plans = catalog
        .list_available(query.include_enterprise)
        .into_iter()
        .cloned()
        .collect();
    Json(plans)
}

#[derive(Debug, Deserialize)]
pub struct ChangeTierRequest {
    pub new_tier: String,
}

/// Local-only plan change; externally managed subscriptions must go through
/// the provider's checkout/portal flow.
pub async fn change_tier(
    Extension(store): Extension<Arc<dyn SubscriptionStore>>,
    Extension(clock): Extension<Arc<dyn Clock>>,
    context: TenantContext,
    Json(payload): Json<ChangeTierRequest>,
) -> AppResult<Json<Subscription>> {
    let tier: PlanTier = payload
        .new_tier
        .parse()
        .map_err(|_| AppError::Validation(format!("unknown tier: {}", payload.new_tier)))?;
    if tier == PlanTier::Enterprise {
        return Err(AppError::Validation(
            "enterprise plans are not self-serve; contact sales".into(),
        ));
    }

    let now = clock.now();
    let rows = store
        .list_subscriptions(context.tenant_id)
        .await
        .map_err(store_error)?;
    let current = resolve_current(&rows, now).ok_or(AppError::NotFound("subscription"))?;
    let updated = store
        .change_tier_locally(current.id, tier, now)
        .await
        .map_err(store_error)?;
    Ok(Json(updated))
}

pub async fn cancel_subscription(
    Extension(store): Extension<Arc<dyn SubscriptionStore>>,
    Extension(clock): Extension<Arc<dyn Clock>>,
    context: TenantContext,
) -> AppResult<Json<Subscription>> {
    let now = clock.now();
    let rows = store
        .list_subscriptions(context.tenant_id)
        .await
        .map_err(store_error)?;
    let current = resolve_current(&rows, now).ok_or(AppError::NotFound("subscription"))?;
    if current.is_externally_managed() {
        return Err(AppError::UseExternalCheckout);
    }
    let cancelled = store
        .apply_cancellation(current.id, now, *config::BILLING_CANCELLATION_GRACE_DAYS)
        .await
        .map_err(store_error)?;
    Ok(Json(cancelled))
}

/// key: quota-api -> governor boundary for resource-owning services
#[derive(Debug, Deserialize)]
#[serde(tag = "check", rename_all = "kebab-case")]
pub enum QuotaCheck {
    Ceiling {
        resource: ResourceKind,
        current_count: i64,
    },
    RateLimit,
    TokenBudget {
        #[serde(default)]
        requested: i64,
    },
    Feature {
        flag: FeatureFlag,
    },
}

#[derive(Debug, Deserialize)]
pub struct QuotaCheckRequest {
    #[serde(flatten)]
    pub check: QuotaCheck,
    /// With `enforce` set, a denial comes back as the structured
    /// quota/feature error instead of a 200 decision body.
    #[serde(default)]
    pub enforce: bool,
}

fn quota_denial(decision: &QuotaDecision) -> AppError {
    AppError::QuotaExceeded {
        resource: decision.resource.clone(),
        used: decision.used,
        limit: decision.limit.unwrap_or(0),
        suggestion: decision.suggestion.unwrap_or(UpgradeHint::ContactSales),
    }
}

fn feature_denial(decision: &FeatureDecision) -> AppError {
    AppError::FeatureNotAvailable {
        flag: decision.flag,
        required_tier: decision.required_tier,
        suggestion: decision
            .suggestion
            .unwrap_or(UpgradeHint::ContactSales),
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(untagged)]
pub enum QuotaCheckResponse {
    Quota(QuotaDecision),
    Feature(FeatureDecision),
}

pub async fn check_quota(
    Extension(governor): Extension<Arc<QuotaGovernor>>,
    context: TenantContext,
    Json(payload): Json<QuotaCheckRequest>,
) -> AppResult<Json<QuotaCheckResponse>> {
    let response = match payload.check {
        QuotaCheck::Ceiling {
            resource,
            current_count,
        } => QuotaCheckResponse::Quota(
            governor
                .check_ceiling(context.tenant_id, resource, current_count)
                .await
                .map_err(store_error)?,
        ),
        QuotaCheck::RateLimit => QuotaCheckResponse::Quota(
            governor
                .check_rate_limit(context.tenant_id)
                .await
                .map_err(store_error)?,
        ),
        QuotaCheck::TokenBudget { requested } => QuotaCheckResponse::Quota(
            governor
                .check_token_budget(context.tenant_id, requested)
                .await
                .map_err(store_error)?,
        ),
        QuotaCheck::Feature { flag } => QuotaCheckResponse::Feature(
            governor
                .check_feature_access(context.tenant_id, flag)
                .await
                .map_err(store_error)?,
        ),
    };

    if payload.enforce {
        match &response {
            QuotaCheckResponse::Quota(decision) if !decision.allowed => {
                return Err(quota_denial(decision));
            }
            QuotaCheckResponse::Feature(decision) if !decision.allowed => {
                return Err(feature_denial(decision));
            }
            _ => {}
        }
    }
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct RecordUsageRequest {
    pub kind: UsageKind,
    #[serde(default = "default_amount")]
    pub amount: i64,
}

fn default_amount() -> i64 {
    1
}

/// Called by consumers after the guarded action succeeded, never before.
pub async fn record_usage(
    Extension(governor): Extension<Arc<QuotaGovernor>>,
    context: TenantContext,
    Json(payload): Json<RecordUsageRequest>,
) -> AppResult<StatusCode> {
    if payload.amount <= 0 {
        return Err(AppError::Validation("amount must be positive".into()));
    }
    governor
        .record_usage(context.tenant_id, payload.kind, payload.amount)
        .await
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Post-reset AI counters; the assistant handler reads these to supply the
/// message-ceiling count.
pub async fn get_ai_usage(
    Extension(governor): Extension<Arc<QuotaGovernor>>,
    context: TenantContext,
) -> AppResult<Json<AiUsage>> {
    let usage = governor
        .ai_usage(context.tenant_id)
        .await
        .map_err(store_error)?;
    Ok(Json(usage))
}
