use std::sync::Arc;

use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::PlanTier;
use crate::clock::Clock;

use super::models::{map_provider_status, SubscriptionStatus};
use super::store::{StoreError, SubscriptionStore, UpsertFromExternal};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid webhook signature")]
    SignatureInvalid,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Verified provider event. `data.object` carries the provider's resource
/// snapshot; tenant identity and target tier ride in its `metadata`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl ProviderEvent {
    fn object(&self) -> &Value {
        &self.data["object"]
    }

    pub fn object_str(&self, key: &str) -> Option<&str> {
        self.object().get(key).and_then(Value::as_str)
    }

    pub fn object_i64(&self, key: &str) -> Option<i64> {
        self.object().get(key).and_then(Value::as_i64)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.object()
            .get("metadata")
            .and_then(|metadata| metadata.get(key))
            .and_then(Value::as_str)
    }

    /// The external subscription id this event concerns, if any.
    fn external_subscription_id(&self) -> Option<&str> {
        if self.event_type.starts_with("customer.subscription.") {
            self.object_str("id")
        } else {
            self.object_str("subscription")
        }
    }
}

/// Signature value for a payload, in the `sha256=<hex>` header format.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// key: billing-event-processor -> verified events through the state machine
///
/// Sole writer of subscription status/tier from the provider side. Mutations
/// for one subscription identity are serialized through a per-key lock so
/// duplicate or near-simultaneous deliveries cannot interleave into a lost
/// update; cross-tenant ordering is unconstrained.
pub struct BillingEventProcessor {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    secret: String,
    grace_days: i64,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BillingEventProcessor {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn Clock>,
        secret: String,
        grace_days: i64,
    ) -> Self {
        Self {
            store,
            clock,
            secret,
            grace_days,
            locks: DashMap::new(),
        }
    }

    /// Verify the HMAC over the raw payload before anything is parsed.
    pub fn verify(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<ProviderEvent, ProcessError> {
        let signature = signature.ok_or(ProcessError::SignatureInvalid)?;
        let expected = sign_payload(&self.secret, payload);
        if expected != signature {
            return Err(ProcessError::SignatureInvalid);
        }
        serde_json::from_slice(payload).map_err(|err| ProcessError::Malformed(err.to_string()))
    }

    /// Apply a verified event exactly once. Redeliveries of an already
    /// recorded event id are acknowledged as no-ops; handler failures
    /// propagate unrecorded so the provider's redelivery can retry.
    pub async fn process(&self, event: &ProviderEvent) -> Result<(), ProcessError> {
        let key = event
            .external_subscription_id()
            .or_else(|| event.metadata_str("tenant_id"))
            .unwrap_or(&event.id)
            .to_string();
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock().await;

        if self.store.billing_event_seen(&event.id).await? {
            debug!(event_id = %event.id, "billing event already processed; acknowledging redelivery");
            return Ok(());
        }

        self.dispatch(event).await?;
        self.store
            .record_billing_event(&event.id, &event.event_type, self.clock.now())
            .await?;
        Ok(())
    }

    async fn dispatch(&self, event: &ProviderEvent) -> Result<(), ProcessError> {
        match event.event_type.as_str() {
            "checkout.session.completed" => self.handle_checkout_completed(event).await,
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.handle_subscription_upsert(event).await
            }
            "customer.subscription.deleted" => self.handle_subscription_deleted(event).await,
            "invoice.paid" => self.handle_invoice_paid(event).await,
            "invoice.payment_failed" => self.handle_payment_failed(event).await,
            other => {
                debug!(event_type = other, event_id = %event.id, "acknowledging unhandled billing event type");
                Ok(())
            }
        }
    }

    async fn handle_checkout_completed(&self, event: &ProviderEvent) -> Result<(), ProcessError> {
        let Some(tenant_external) = event.metadata_str("tenant_id") else {
            warn!(event_id = %event.id, "checkout completed without tenant metadata; dropping");
            return Ok(());
        };
        let Some(tier) = event
            .metadata_str("tier")
            .and_then(|raw| raw.parse::<PlanTier>().ok())
        else {
            warn!(event_id = %event.id, tenant = tenant_external, "checkout completed without a valid tier; dropping");
            return Ok(());
        };
        let Some(external_subscription_id) = event.object_str("subscription") else {
            warn!(event_id = %event.id, tenant = tenant_external, "checkout completed without a subscription id; dropping");
            return Ok(());
        };

        let now = self.clock.now();
        let tenant = match self.store.find_tenant_by_external(tenant_external).await? {
            Some(tenant) => tenant,
            None => {
                // A paid signup must never be silently lost, even when the
                // event beats onboarding.
                warn!(
                    tenant = tenant_external,
                    "checkout completed for unknown tenant; provisioning placeholder"
                );
                self.store
                    .create_placeholder_tenant(tenant_external, now)
                    .await?
            }
        };

        let subscription = self
            .store
            .upsert_from_external(
                UpsertFromExternal {
                    tenant_id: tenant.id,
                    external_subscription_id: external_subscription_id.to_string(),
                    tier,
                    status: Some(SubscriptionStatus::Active),
                    external_customer_id: event.object_str("customer").map(str::to_string),
                    trial_expiry: None,
                },
                now,
            )
            .await?;
        info!(
            tenant = %tenant.id,
            subscription = %subscription.id,
            tier = %tier,
            "checkout completed; subscription activated"
        );
        Ok(())
    }

    async fn handle_subscription_upsert(&self, event: &ProviderEvent) -> Result<(), ProcessError> {
        let Some(tenant_external) = event.metadata_str("tenant_id") else {
            warn!(event_id = %event.id, "subscription event without tenant metadata; dropping");
            return Ok(());
        };
        let Some(external_subscription_id) = event.object_str("id") else {
            warn!(event_id = %event.id, "subscription event without a subscription id; dropping");
            return Ok(());
        };
        let Some(tenant) = self.store.find_tenant_by_external(tenant_external).await? else {
            warn!(event_id = %event.id, tenant = tenant_external, "subscription event for unknown tenant; dropping");
            return Ok(());
        };

        let existing = self
            .store
            .find_by_external_subscription(external_subscription_id)
            .await?;
        let tier = event
            .metadata_str("tier")
            .and_then(|raw| raw.parse::<PlanTier>().ok())
            .or_else(|| existing.as_ref().map(|subscription| subscription.tier));
        let Some(tier) = tier else {
            warn!(event_id = %event.id, tenant = tenant_external, "subscription event without a resolvable tier; dropping");
            return Ok(());
        };

        let status = event.object_str("status").and_then(map_provider_status);
        let trial_expiry = event
            .object_i64("trial_end")
            .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single());

        let subscription = self
            .store
            .upsert_from_external(
                UpsertFromExternal {
                    tenant_id: tenant.id,
                    external_subscription_id: external_subscription_id.to_string(),
                    tier,
                    status,
                    external_customer_id: event.object_str("customer").map(str::to_string),
                    trial_expiry,
                },
                self.clock.now(),
            )
            .await?;
        info!(
            tenant = %tenant.id,
            subscription = %subscription.id,
            status = %subscription.status,
            "subscription synced from provider"
        );
        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: &ProviderEvent) -> Result<(), ProcessError> {
        let Some(external_subscription_id) = event.object_str("id") else {
            warn!(event_id = %event.id, "subscription deletion without a subscription id; dropping");
            return Ok(());
        };
        let Some(subscription) = self
            .store
            .find_by_external_subscription(external_subscription_id)
            .await?
        else {
            debug!(external_subscription_id, "deletion for unknown subscription; ignoring");
            return Ok(());
        };

        // Entitlement is retained at the prior tier until grace_period_end;
        // the quota governor enforces the cutoff.
        let cancelled = self
            .store
            .apply_cancellation(subscription.id, self.clock.now(), self.grace_days)
            .await?;
        info!(
            subscription = %cancelled.id,
            grace_period_end = ?cancelled.grace_period_end,
            "subscription cancelled"
        );
        Ok(())
    }

    async fn handle_invoice_paid(&self, event: &ProviderEvent) -> Result<(), ProcessError> {
        let Some(external_subscription_id) = event.object_str("subscription") else {
            debug!(event_id = %event.id, "invoice.paid without a subscription reference; ignoring");
            return Ok(());
        };
        match self
            .store
            .find_by_external_subscription(external_subscription_id)
            .await?
        {
            Some(subscription) => {
                let recovered = self
                    .store
                    .apply_invoice_paid(subscription.id, self.clock.now())
                    .await?;
                info!(subscription = %recovered.id, "invoice paid; subscription active");
            }
            None => debug!(external_subscription_id, "invoice.paid for unknown subscription; ignoring"),
        }
        Ok(())
    }

    async fn handle_payment_failed(&self, event: &ProviderEvent) -> Result<(), ProcessError> {
        let Some(external_subscription_id) = event.object_str("subscription") else {
            debug!(event_id = %event.id, "payment failure without a subscription reference; ignoring");
            return Ok(());
        };
        match self
            .store
            .find_by_external_subscription(external_subscription_id)
            .await?
        {
            Some(subscription) => {
                let suspended = self
                    .store
                    .apply_payment_failure(subscription.id, self.clock.now())
                    .await?;
                info!(subscription = %suspended.id, "payment failed; subscription suspended");
            }
            None => {
                debug!(external_subscription_id, "payment failure for unknown subscription; ignoring")
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let payload = br#"{"id":"evt_1","type":"invoice.paid","data":{}}"#;
        let signature = sign_payload("whsec_test", payload);
        assert!(signature.starts_with("sha256="));
        assert_ne!(signature, sign_payload("whsec_other", payload));
    }

    #[test]
    fn event_metadata_accessors() {
        let event: ProviderEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_42",
            "type": "customer.subscription.updated",
            "data": {
                "object": {
                    "id": "sub_1",
                    "status": "past_due",
                    "metadata": {"tenant_id": "ext-7", "tier": "business"}
                }
            }
        }))
        .unwrap();
        assert_eq!(event.metadata_str("tenant_id"), Some("ext-7"));
        assert_eq!(event.object_str("status"), Some("past_due"));
        assert_eq!(event.external_subscription_id(), Some("sub_1"));
    }
}
