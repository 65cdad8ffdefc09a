use axum::{
    routing::{get, post},
    Router,
};

use crate::subscriptions::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/billing/webhook", post(api::billing_webhook))
        .route("/api/billing/checkout", post(api::create_checkout_session))
        .route("/api/billing/subscription", get(api::get_subscription))
        .route(
            "/api/billing/subscription/change-tier",
            post(api::change_tier),
        )
        .route(
            "/api/billing/subscription/cancel",
            post(api::cancel_subscription),
        )
        .route("/api/billing/plans", get(api::list_plans))
        .route("/api/quota/check", post(api::check_quota))
        .route("/api/quota/usage", post(api::record_usage))
        .route("/api/quota/ai-usage", get(api::get_ai_usage))
}
