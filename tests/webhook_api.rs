use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Body, http::Request, Extension, Router};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use entitlement_engine::catalog::{PlanCatalog, PlanTier};
use entitlement_engine::clock::{Clock, ManualClock};
use entitlement_engine::routes::api_routes;
use entitlement_engine::subscriptions::{
    sign_payload, BillingEventProcessor, BillingProviderAdapter, CheckoutSession,
    CheckoutSessionRequest, MemoryStore, ProviderError, QuotaGovernor, Subscription,
    SubscriptionStatus, SubscriptionStore, Tenant, TenantStatus,
};

// key: webhook-api-tests -> boundary status codes and bodies

const SECRET: &str = "whsec_router_test";

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
}

struct StubAdapter;

#[async_trait]
impl BillingProviderAdapter for StubAdapter {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        Ok(CheckoutSession {
            session_id: "cs_test_1".to_string(),
            checkout_url: format!("https://pay.example.com/{}", request.tenant_external_id),
        })
    }
}

fn app(store: Arc<MemoryStore>, clock: ManualClock) -> Router {
    let store: Arc<dyn SubscriptionStore> = store;
    let clock: Arc<dyn Clock> = Arc::new(clock);
    let catalog = Arc::new(PlanCatalog::default());
    let processor = Arc::new(BillingEventProcessor::new(
        store.clone(),
        clock.clone(),
        SECRET.to_string(),
        7,
    ));
    let governor = Arc::new(QuotaGovernor::new(store.clone(), catalog.clone(), clock.clone()));
    let adapter: Arc<dyn BillingProviderAdapter> = Arc::new(StubAdapter);
    api_routes()
        .layer(Extension(store))
        .layer(Extension(clock))
        .layer(Extension(catalog))
        .layer(Extension(processor))
        .layer(Extension(governor))
        .layer(Extension(adapter))
}

fn seed_tenant(store: &MemoryStore) -> Uuid {
    let id = Uuid::new_v4();
    store.insert_tenant(Tenant {
        id,
        external_id: format!("ext-{id}"),
        name: "Router Org".to_string(),
        status: TenantStatus::Active,
        created_at: start_time(),
        updated_at: start_time(),
    });
    id
}

fn seed_subscription(
    store: &MemoryStore,
    tenant_id: Uuid,
    tier: PlanTier,
    external_subscription_id: Option<&str>,
) {
    store.insert_subscription(Subscription {
        id: Uuid::new_v4(),
        tenant_id,
        tier,
        status: SubscriptionStatus::Active,
        start_date: start_time() - Duration::days(5),
        end_date: None,
        trial_expiry: None,
        grace_period_end: None,
        external_customer_id: None,
        external_subscription_id: external_subscription_id.map(str::to_string),
        created_at: start_time() - Duration::days(5),
        updated_at: start_time() - Duration::days(5),
    });
}

fn bearer_token(tenant_id: Uuid) -> String {
    std::env::set_var("JWT_SECRET", "secret");
    let claims = json!({ "sub": "user-1", "tid": tenant_id, "exp": 9_999_999_999u64 });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"secret"),
    )
    .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn webhook_without_signature_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let app = app(store.clone(), ManualClock::new(start_time()));

    let payload = json!({ "id": "evt_1", "type": "invoice.paid", "data": {} }).to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/api/billing/webhook")
        .body(Body::from(payload))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), 400);
    let body = body_json(response).await;
    assert_eq!(body["code"], "signature_invalid");
    assert_eq!(store.billing_event_count(), 0);
}

#[tokio::test]
async fn webhook_with_valid_signature_is_processed() {
    let store = Arc::new(MemoryStore::new());
    let app = app(store.clone(), ManualClock::new(start_time()));

    let payload = json!({
        "id": "evt_router_1",
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "subscription": "sub_router_1",
                "metadata": { "tenant_id": "ext-router", "tier": "professional" }
            }
        }
    })
    .to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/api/billing/webhook")
        .header("signature", sign_payload(SECRET, payload.as_bytes()))
        .body(Body::from(payload))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    assert_eq!(body["received"], true);
    assert!(store
        .find_by_external_subscription("sub_router_1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn webhook_with_unparseable_payload_is_rejected_unrecorded() {
    let store = Arc::new(MemoryStore::new());
    let app = app(store.clone(), ManualClock::new(start_time()));

    let payload = "not json";
    let request = Request::builder()
        .method("POST")
        .uri("/api/billing/webhook")
        .header("signature", sign_payload(SECRET, payload.as_bytes()))
        .body(Body::from(payload))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), 400);
    let body = body_json(response).await;
    assert_eq!(body["code"], "validation_error");
    assert_eq!(store.billing_event_count(), 0);
}

#[tokio::test]
async fn subscription_status_defaults_to_starter() {
    let store = Arc::new(MemoryStore::new());
    let tenant_id = seed_tenant(&store);
    let app = app(store, ManualClock::new(start_time()));

    let request = Request::builder()
        .uri("/api/billing/subscription")
        .header("authorization", format!("Bearer {}", bearer_token(tenant_id)))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    assert_eq!(body["tier"], "starter");
    assert_eq!(body["status"], "none");
    assert_eq!(body["limits"]["max_requests_per_hour"], 60);
}

#[tokio::test]
async fn quota_endpoints_require_identity() {
    let store = Arc::new(MemoryStore::new());
    let app = app(store, ManualClock::new(start_time()));

    let response = app
        .oneshot(post_json(
            "/api/quota/check",
            None,
            json!({ "check": "rate-limit" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body = body_json(response).await;
    assert_eq!(body["code"], "auth_error");
}

#[tokio::test]
async fn ceiling_denial_carries_limit_and_suggestion() {
    let store = Arc::new(MemoryStore::new());
    let tenant_id = seed_tenant(&store);
    seed_subscription(&store, tenant_id, PlanTier::Starter, Some("sub_q"));
    let app = app(store, ManualClock::new(start_time()));

    let token = bearer_token(tenant_id);
    let response = app
        .oneshot(post_json(
            "/api/quota/check",
            Some(&token),
            json!({ "check": "ceiling", "resource": "client-spaces", "current_count": 5 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    assert_eq!(body["allowed"], false);
    assert_eq!(body["used"], 5);
    assert_eq!(body["limit"], 5);
    assert_eq!(body["suggestion"]["kind"], "upgrade");
    assert_eq!(body["suggestion"]["tier"], "professional");
}

#[tokio::test]
async fn enforced_ceiling_denial_is_a_structured_quota_error() {
    let store = Arc::new(MemoryStore::new());
    let tenant_id = seed_tenant(&store);
    seed_subscription(&store, tenant_id, PlanTier::Starter, Some("sub_e"));
    let app = app(store, ManualClock::new(start_time()));

    let token = bearer_token(tenant_id);
    let response = app
        .oneshot(post_json(
            "/api/quota/check",
            Some(&token),
            json!({
                "check": "ceiling",
                "resource": "client-spaces",
                "current_count": 5,
                "enforce": true
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    let body = body_json(response).await;
    assert_eq!(body["code"], "quota_exceeded");
    assert_eq!(body["used"], 5);
    assert_eq!(body["limit"], 5);
    assert_eq!(body["suggestion"]["tier"], "professional");
}

#[tokio::test]
async fn enforced_feature_denial_names_required_tier() {
    let store = Arc::new(MemoryStore::new());
    let tenant_id = seed_tenant(&store);
    seed_subscription(&store, tenant_id, PlanTier::Starter, Some("sub_f"));
    let app = app(store, ManualClock::new(start_time()));

    let token = bearer_token(tenant_id);
    let response = app
        .oneshot(post_json(
            "/api/quota/check",
            Some(&token),
            json!({ "check": "feature", "flag": "cross-tenant-search", "enforce": true }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    let body = body_json(response).await;
    assert_eq!(body["code"], "feature_not_available");
    assert_eq!(body["required_tier"], "business");
}

#[tokio::test]
async fn record_usage_then_rate_check_reflects_it() {
    let store = Arc::new(MemoryStore::new());
    let tenant_id = seed_tenant(&store);
    let app = app(store, ManualClock::new(start_time()));

    let token = bearer_token(tenant_id);
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/quota/usage",
            Some(&token),
            json!({ "kind": "request" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let response = app
        .oneshot(post_json(
            "/api/quota/check",
            Some(&token),
            json!({ "check": "rate-limit" }),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["used"], 1);
}

#[tokio::test]
async fn checkout_rejects_enterprise_with_contact_sales() {
    let store = Arc::new(MemoryStore::new());
    let tenant_id = seed_tenant(&store);
    let app = app(store, ManualClock::new(start_time()));

    let token = bearer_token(tenant_id);
    let response = app
        .oneshot(post_json(
            "/api/billing/checkout",
            Some(&token),
            json!({
                "target_tier": "enterprise",
                "billing_interval": "monthly",
                "success_url": "https://app.example.com/ok",
                "cancel_url": "https://app.example.com/cancel"
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body = body_json(response).await;
    assert_eq!(body["code"], "validation_error");
    assert!(body["message"].as_str().unwrap().contains("contact sales"));
}

#[tokio::test]
async fn checkout_returns_provider_session() {
    let store = Arc::new(MemoryStore::new());
    let tenant_id = seed_tenant(&store);
    let app = app(store, ManualClock::new(start_time()));

    let token = bearer_token(tenant_id);
    let response = app
        .oneshot(post_json(
            "/api/billing/checkout",
            Some(&token),
            json!({
                "target_tier": "professional",
                "billing_interval": "yearly",
                "success_url": "https://app.example.com/ok",
                "cancel_url": "https://app.example.com/cancel"
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    assert_eq!(body["session_id"], "cs_test_1");
    assert!(body["checkout_url"].as_str().unwrap().starts_with("https://pay.example.com/"));
}

#[tokio::test]
async fn change_tier_on_external_subscription_directs_to_portal() {
    let store = Arc::new(MemoryStore::new());
    let tenant_id = seed_tenant(&store);
    seed_subscription(&store, tenant_id, PlanTier::Professional, Some("sub_ext"));
    let app = app(store, ManualClock::new(start_time()));

    let token = bearer_token(tenant_id);
    let response = app
        .oneshot(post_json(
            "/api/billing/subscription/change-tier",
            Some(&token),
            json!({ "new_tier": "business" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), 409);
    let body = body_json(response).await;
    assert_eq!(body["code"], "use_external_checkout");
}

#[tokio::test]
async fn change_tier_on_local_subscription_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let tenant_id = seed_tenant(&store);
    seed_subscription(&store, tenant_id, PlanTier::Starter, None);
    let app = app(store, ManualClock::new(start_time()));

    let token = bearer_token(tenant_id);
    let response = app
        .oneshot(post_json(
            "/api/billing/subscription/change-tier",
            Some(&token),
            json!({ "new_tier": "professional" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    assert_eq!(body["tier"], "professional");
}

#[tokio::test]
async fn plans_listing_hides_enterprise_by_default() {
    let store = Arc::new(MemoryStore::new());
    let app = app(store, ManualClock::new(start_time()));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/billing/plans")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 3);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/billing/plans?include_enterprise=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 4);
}
