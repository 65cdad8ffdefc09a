use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::PlanTier;
use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSessionRequest {
    pub tenant_id: Uuid,
    pub tenant_external_id: String,
    pub target_tier: PlanTier,
    pub billing_interval: BillingInterval,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub checkout_url: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

/// key: billing-adapter -> provider integration
#[async_trait]
pub trait BillingProviderAdapter: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProviderError>;
}

/// HTTP adapter for a Stripe-shaped provider API. The tenant's external id
/// and target tier ride in session metadata so the webhook path can route
/// the completed checkout back to the right tenant.
pub struct StripeLikeAdapter {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl StripeLikeAdapter {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            config::BILLING_PROVIDER_ENDPOINT.clone(),
            config::BILLING_PROVIDER_API_KEY.clone(),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ProviderSessionResponse {
    id: String,
    url: String,
}

#[async_trait]
impl BillingProviderAdapter for StripeLikeAdapter {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        let body = serde_json::json!({
            "mode": "subscription",
            "success_url": request.success_url,
            "cancel_url": request.cancel_url,
            "billing_interval": request.billing_interval,
            "metadata": {
                "tenant_id": request.tenant_external_id,
                "tier": request.target_tier,
            },
        });

        let mut http = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.endpoint))
            .json(&body);
        if let Some(api_key) = &self.api_key {
            http = http.bearer_auth(api_key);
        }

        let response = http.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(format!("{status}: {detail}")));
        }

        let session: ProviderSessionResponse = response.json().await?;
        Ok(CheckoutSession {
            session_id: session.id,
            checkout_url: session.url,
        })
    }
}
