use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use entitlement_engine::catalog::PlanTier;
use entitlement_engine::clock::{Clock, ManualClock};
use entitlement_engine::subscriptions::{
    sign_payload, BillingEventProcessor, MemoryStore, ProcessError, ProviderEvent, Subscription,
    SubscriptionStatus, SubscriptionStore, Tenant, TenantStatus,
};

// key: processor-tests -> idempotency,state-machine,redelivery

const SECRET: &str = "whsec_test";

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    clock: ManualClock,
    processor: BillingEventProcessor,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(start_time());
    let processor = BillingEventProcessor::new(
        store.clone() as Arc<dyn SubscriptionStore>,
        Arc::new(clock.clone()) as Arc<dyn Clock>,
        SECRET.to_string(),
        7,
    );
    Harness {
        store,
        clock,
        processor,
    }
}

fn seed_tenant(harness: &Harness, external_id: &str) -> Uuid {
    let id = Uuid::new_v4();
    harness.store.insert_tenant(Tenant {
        id,
        external_id: external_id.to_string(),
        name: "Seeded Org".to_string(),
        status: TenantStatus::Active,
        created_at: start_time(),
        updated_at: start_time(),
    });
    id
}

fn seed_subscription(
    harness: &Harness,
    tenant_id: Uuid,
    external_subscription_id: &str,
    tier: PlanTier,
    status: SubscriptionStatus,
) -> Uuid {
    let id = Uuid::new_v4();
    harness.store.insert_subscription(Subscription {
        id,
        tenant_id,
        tier,
        status,
        start_date: start_time() - Duration::days(10),
        end_date: None,
        trial_expiry: None,
        grace_period_end: None,
        external_customer_id: None,
        external_subscription_id: Some(external_subscription_id.to_string()),
        created_at: start_time() - Duration::days(10),
        updated_at: start_time() - Duration::days(10),
    });
    id
}

fn event(id: &str, event_type: &str, object: Value) -> ProviderEvent {
    serde_json::from_value(json!({
        "id": id,
        "type": event_type,
        "data": { "object": object }
    }))
    .unwrap()
}

#[tokio::test]
async fn checkout_provisions_placeholder_tenant() {
    let harness = harness();
    let event = event(
        "evt_checkout_1",
        "checkout.session.completed",
        json!({
            "subscription": "sub_new",
            "customer": "cus_9",
            "metadata": { "tenant_id": "ext-unknown", "tier": "professional" }
        }),
    );

    harness.processor.process(&event).await.unwrap();

    // A paid signup arriving before onboarding must not be dropped.
    let tenant = harness
        .store
        .find_tenant_by_external("ext-unknown")
        .await
        .unwrap()
        .expect("placeholder tenant provisioned");
    let subscription = harness
        .store
        .find_by_external_subscription("sub_new")
        .await
        .unwrap()
        .expect("subscription attached");
    assert_eq!(subscription.tenant_id, tenant.id);
    assert_eq!(subscription.tier, PlanTier::Professional);
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.external_customer_id.as_deref(), Some("cus_9"));
}

#[tokio::test]
async fn duplicate_delivery_is_a_recorded_no_op() {
    let harness = harness();
    seed_tenant(&harness, "ext-1");
    let event = event(
        "evt_dup",
        "checkout.session.completed",
        json!({
            "subscription": "sub_1",
            "metadata": { "tenant_id": "ext-1", "tier": "business" }
        }),
    );

    harness.processor.process(&event).await.unwrap();
    let first = harness
        .store
        .find_by_external_subscription("sub_1")
        .await
        .unwrap()
        .unwrap();

    // Redelivered minutes later, after the provider timed out the first ack.
    harness.clock.advance(Duration::minutes(5));
    harness.processor.process(&event).await.unwrap();
    let second = harness
        .store
        .find_by_external_subscription("sub_1")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.updated_at, second.updated_at);
    assert_eq!(harness.store.billing_event_count(), 1);
}

#[tokio::test]
async fn payment_failure_then_invoice_paid_round_trips_status() {
    let harness = harness();
    let tenant_id = seed_tenant(&harness, "ext-2");
    seed_subscription(
        &harness,
        tenant_id,
        "sub_2",
        PlanTier::Professional,
        SubscriptionStatus::Active,
    );

    harness
        .processor
        .process(&event(
            "evt_fail",
            "invoice.payment_failed",
            json!({ "subscription": "sub_2" }),
        ))
        .await
        .unwrap();
    let suspended = harness
        .store
        .find_by_external_subscription("sub_2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(suspended.status, SubscriptionStatus::Suspended);

    harness
        .processor
        .process(&event(
            "evt_recover",
            "invoice.paid",
            json!({ "subscription": "sub_2" }),
        ))
        .await
        .unwrap();
    let recovered = harness
        .store
        .find_by_external_subscription("sub_2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovered.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn deletion_cancels_with_seven_day_grace() {
    let harness = harness();
    let tenant_id = seed_tenant(&harness, "ext-3");
    seed_subscription(
        &harness,
        tenant_id,
        "sub_3",
        PlanTier::Business,
        SubscriptionStatus::Active,
    );

    let now = harness.clock.now();
    harness
        .processor
        .process(&event(
            "evt_del",
            "customer.subscription.deleted",
            json!({ "id": "sub_3" }),
        ))
        .await
        .unwrap();

    let cancelled = harness
        .store
        .find_by_external_subscription("sub_3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert_eq!(cancelled.end_date, Some(now));
    assert!(cancelled.grace_period_end.unwrap() >= now + Duration::days(7));
    // The tier is retained; the governor enforces the grace cutoff.
    assert_eq!(cancelled.tier, PlanTier::Business);
}

#[tokio::test]
async fn subscription_event_without_tenant_metadata_is_dropped_but_acked() {
    let harness = harness();
    let event = event(
        "evt_no_meta",
        "customer.subscription.updated",
        json!({ "id": "sub_x", "status": "active" }),
    );

    harness.processor.process(&event).await.unwrap();

    assert!(harness
        .store
        .find_by_external_subscription("sub_x")
        .await
        .unwrap()
        .is_none());
    // Recorded so the provider stops redelivering a payload we will never
    // be able to apply.
    assert_eq!(harness.store.billing_event_count(), 1);
}

#[tokio::test]
async fn unrecognized_event_type_is_acknowledged() {
    let harness = harness();
    harness
        .processor
        .process(&event("evt_future", "charge.refunded", json!({})))
        .await
        .unwrap();
    assert_eq!(harness.store.billing_event_count(), 1);
}

#[tokio::test]
async fn unknown_provider_status_never_clobbers_existing_status() {
    let harness = harness();
    let tenant_id = seed_tenant(&harness, "ext-4");
    seed_subscription(
        &harness,
        tenant_id,
        "sub_4",
        PlanTier::Professional,
        SubscriptionStatus::Active,
    );

    harness
        .processor
        .process(&event(
            "evt_paused",
            "customer.subscription.updated",
            json!({
                "id": "sub_4",
                "status": "paused",
                "metadata": { "tenant_id": "ext-4", "tier": "business" }
            }),
        ))
        .await
        .unwrap();

    let updated = harness
        .store
        .find_by_external_subscription("sub_4")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.status, SubscriptionStatus::Active);
    assert_eq!(updated.tier, PlanTier::Business);
}

#[tokio::test]
async fn new_external_subscription_id_creates_a_new_row() {
    let harness = harness();
    let tenant_id = seed_tenant(&harness, "ext-5");
    seed_subscription(
        &harness,
        tenant_id,
        "sub_old",
        PlanTier::Starter,
        SubscriptionStatus::Active,
    );

    harness
        .processor
        .process(&event(
            "evt_new_sub",
            "customer.subscription.created",
            json!({
                "id": "sub_newer",
                "status": "trialing",
                "trial_end": harness.clock.now().timestamp() + 14 * 86_400,
                "metadata": { "tenant_id": "ext-5", "tier": "professional" }
            }),
        ))
        .await
        .unwrap();

    let rows = harness.store.list_subscriptions(tenant_id).await.unwrap();
    assert_eq!(rows.len(), 2);
    let newer = harness
        .store
        .find_by_external_subscription("sub_newer")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(newer.status, SubscriptionStatus::Trial);
    assert!(newer.trial_expiry.is_some());
}

#[tokio::test]
async fn same_external_id_mutates_in_place_across_tier_changes() {
    let harness = harness();
    seed_tenant(&harness, "ext-6");

    harness
        .processor
        .process(&event(
            "evt_up_1",
            "customer.subscription.created",
            json!({
                "id": "sub_6",
                "status": "active",
                "metadata": { "tenant_id": "ext-6", "tier": "starter" }
            }),
        ))
        .await
        .unwrap();
    harness
        .processor
        .process(&event(
            "evt_up_2",
            "customer.subscription.updated",
            json!({
                "id": "sub_6",
                "status": "active",
                "metadata": { "tenant_id": "ext-6", "tier": "business" }
            }),
        ))
        .await
        .unwrap();

    let tenant = harness
        .store
        .find_tenant_by_external("ext-6")
        .await
        .unwrap()
        .unwrap();
    let rows = harness.store.list_subscriptions(tenant.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].tier, PlanTier::Business);
}

#[tokio::test]
async fn verify_rejects_missing_and_mismatched_signatures() {
    let harness = harness();
    let payload = br#"{"id":"evt_sig","type":"invoice.paid","data":{}}"#;

    assert!(matches!(
        harness.processor.verify(payload, None),
        Err(ProcessError::SignatureInvalid)
    ));
    assert!(matches!(
        harness
            .processor
            .verify(payload, Some("sha256=deadbeef")),
        Err(ProcessError::SignatureInvalid)
    ));

    let event = harness
        .processor
        .verify(payload, Some(&sign_payload(SECRET, payload)))
        .unwrap();
    assert_eq!(event.id, "evt_sig");
    assert_eq!(event.event_type, "invoice.paid");
}

#[tokio::test]
async fn verify_rejects_unparseable_payloads_after_signature_check() {
    let harness = harness();
    let payload = b"not json at all";
    let result = harness
        .processor
        .verify(payload, Some(&sign_payload(SECRET, payload)));
    assert!(matches!(result, Err(ProcessError::Malformed(_))));
}
