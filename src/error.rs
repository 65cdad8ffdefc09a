use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::{FeatureFlag, PlanTier, UpgradeHint};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("authentication required: {0}")]
    Auth(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("quota exceeded for {resource}")]
    QuotaExceeded {
        resource: String,
        used: i64,
        limit: i64,
        suggestion: UpgradeHint,
    },
    #[error("feature {flag} is not available on the current plan")]
    FeatureNotAvailable {
        flag: FeatureFlag,
        required_tier: Option<PlanTier>,
        suggestion: UpgradeHint,
    },
    #[error("invalid webhook signature")]
    SignatureInvalid,
    #[error("billing provider error: {0}")]
    Provider(String),
    #[error("subscription is managed by the billing provider; use the checkout/portal flow")]
    UseExternalCheckout,
    #[error("storage failure [{correlation_id}]")]
    Storage {
        correlation_id: Uuid,
        #[source]
        source: anyhow::Error,
    },
}

impl AppError {
    /// Wrap a storage-layer failure; the underlying error is logged here and
    /// never leaked to the caller.
    pub fn storage(source: anyhow::Error) -> Self {
        let correlation_id = Uuid::new_v4();
        tracing::error!(%correlation_id, ?source, "storage failure");
        AppError::Storage {
            correlation_id,
            source,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Auth(_) => "auth_error",
            AppError::NotFound(_) => "not_found",
            AppError::QuotaExceeded { .. } => "quota_exceeded",
            AppError::FeatureNotAvailable { .. } => "feature_not_available",
            AppError::SignatureInvalid => "signature_invalid",
            AppError::Provider(_) => "external_provider_error",
            AppError::UseExternalCheckout => "use_external_checkout",
            AppError::Storage { .. } => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) | AppError::SignatureInvalid => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::QuotaExceeded { .. } | AppError::FeatureNotAvailable { .. } => {
                StatusCode::FORBIDDEN
            }
            AppError::UseExternalCheckout => StatusCode::CONFLICT,
            AppError::Provider(_) => StatusCode::BAD_GATEWAY,
            AppError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        match &self {
            AppError::QuotaExceeded {
                used,
                limit,
                suggestion,
                ..
            } => {
                body["used"] = json!(used);
                body["limit"] = json!(limit);
                body["suggestion"] = json!(suggestion);
            }
            AppError::FeatureNotAvailable {
                required_tier,
                suggestion,
                ..
            } => {
                body["required_tier"] = json!(required_tier);
                body["suggestion"] = json!(suggestion);
            }
            _ => {}
        }

        tracing::error!(code = self.code(), error = %self);
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
