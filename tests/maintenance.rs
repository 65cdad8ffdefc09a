use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use uuid::Uuid;

use entitlement_engine::clock::ManualClock;
use entitlement_engine::subscriptions::{maintenance, MemoryStore, SubscriptionStore};

// key: maintenance-tests -> advisory pruning only

#[tokio::test]
async fn tick_prunes_only_entries_outside_the_window() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc.with_ymd_and_hms(2024, 8, 1, 12, 0, 0).unwrap();
    let clock = ManualClock::new(now);
    let tenant_id = Uuid::new_v4();

    store
        .record_request(tenant_id, now - Duration::minutes(90))
        .await
        .unwrap();
    store
        .record_request(tenant_id, now - Duration::minutes(30))
        .await
        .unwrap();

    maintenance::process_tick(store.as_ref(), &clock).await.unwrap();

    let remaining = store
        .requests_since(tenant_id, now - Duration::hours(24))
        .await
        .unwrap();
    assert_eq!(remaining, 1);

    // The rate limit itself never depends on pruning; the recount still
    // sees the surviving entry.
    let in_window = store
        .requests_since(tenant_id, now - Duration::minutes(60))
        .await
        .unwrap();
    assert_eq!(in_window, 1);
}
