//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header, claims the event id so each event
//! is processed once, and routes checkout and subscription events into the
//! reconciler.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, EventType};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::entitlement::EntitlementService;
use crate::error::{BillingError, BillingResult};
use crate::models::OrderStatus;
use crate::provider::CheckoutSessionSnapshot;
use crate::reconcile::SessionReconciler;
use crate::store::EntitlementStore;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Check a `t=…,v1=…` signature header against `payload`.
///
/// The signed string is `"{t}.{payload}"`, HMAC-SHA256 keyed with the full
/// endpoint secret. Any of several `v1` entries may match.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in Stripe-Signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in Stripe-Signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = mac.finalize().into_bytes();

    let matched = signatures
        .iter()
        .any(|sig| bool::from(sig.as_slice().ct_eq(expected.as_slice())));
    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// What a verified event asks us to do
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookAction {
    /// Payment settled: grant the tier, issue the code
    Fulfill(CheckoutSessionSnapshot),
    /// Checkout completed with a payment that has not settled yet
    RecordPending(CheckoutSessionSnapshot),
    CloseOrder {
        session_id: String,
        status: OrderStatus,
    },
    /// Subscription ended, demote the customer to FREE
    EndSubscription { customer_id: String },
    Ignore,
}

impl WebhookAction {
    pub fn from_event(event: &Event) -> BillingResult<Self> {
        let session = || match &event.data.object {
            EventObject::CheckoutSession(session) => Ok(CheckoutSessionSnapshot::from(session)),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected CheckoutSession".to_string(),
            )),
        };

        Ok(match event.type_ {
            EventType::CheckoutSessionCompleted => {
                let session = session()?;
                if session.is_paid() {
                    WebhookAction::Fulfill(session)
                } else {
                    WebhookAction::RecordPending(session)
                }
            }
            EventType::CheckoutSessionAsyncPaymentSucceeded => WebhookAction::Fulfill(session()?),
            EventType::CheckoutSessionAsyncPaymentFailed => WebhookAction::CloseOrder {
                session_id: session()?.id,
                status: OrderStatus::Rejected,
            },
            EventType::CheckoutSessionExpired => WebhookAction::CloseOrder {
                session_id: session()?.id,
                status: OrderStatus::Cancelled,
            },
            EventType::CustomerSubscriptionDeleted => match &event.data.object {
                EventObject::Subscription(subscription) => WebhookAction::EndSubscription {
                    customer_id: subscription.customer.id().to_string(),
                },
                _ => {
                    return Err(BillingError::WebhookEventNotSupported(
                        "Expected Subscription".to_string(),
                    ))
                }
            },
            _ => WebhookAction::Ignore,
        })
    }
}

#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn EntitlementStore>,
    reconciler: SessionReconciler,
    entitlements: EntitlementService,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        reconciler: SessionReconciler,
        entitlements: EntitlementService,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            store: entitlements.store().clone(),
            reconciler,
            entitlements,
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Verify the signature and parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        if self.webhook_secret.is_empty() {
            return Err(BillingError::NotConfigured(
                "STRIPE_WEBHOOK_SECRET not set".to_string(),
            ));
        }
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, &self.webhook_secret, now)?;

        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::InvalidInput(format!("unparseable webhook event: {}", e))
        })
    }

    /// Handle a verified event
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let action = WebhookAction::from_event(&event)?;
        self.handle_action(event.id.as_str(), &event.type_.to_string(), action)
            .await
    }

    /// Claim `event_id`, apply `action`, record the result.
    ///
    /// A second delivery of a claimed or finished event is a no-op.
    pub async fn handle_action(
        &self,
        event_id: &str,
        event_type: &str,
        action: WebhookAction,
    ) -> BillingResult<()> {
        if action == WebhookAction::Ignore {
            tracing::debug!(event_id = %event_id, event_type = %event_type, "Ignoring Stripe event");
            return Ok(());
        }

        if !self.store.claim_webhook_event(event_id, event_type).await? {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event, already claimed"
            );
            return Ok(());
        }

        tracing::info!(event_id = %event_id, event_type = %event_type, "Processing Stripe event");
        let result = self.apply(action).await;

        let (outcome, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        if let Err(e) = self
            .store
            .finish_webhook_event(event_id, outcome, error_message.as_deref())
            .await
        {
            tracing::warn!(event_id = %event_id, error = %e, "Retrying webhook audit update");
            if let Err(retry) = self
                .store
                .finish_webhook_event(event_id, outcome, error_message.as_deref())
                .await
            {
                tracing::error!(
                    event_id = %event_id,
                    error = %retry,
                    "Failed to record webhook result, event stays in processing until the claim times out"
                );
            }
        }

        result
    }

    async fn apply(&self, action: WebhookAction) -> BillingResult<()> {
        match action {
            WebhookAction::Fulfill(session) => {
                self.reconciler.fulfill_checkout(&session).await?;
            }
            WebhookAction::RecordPending(session) => {
                self.reconciler.record_pending(&session).await?;
            }
            WebhookAction::CloseOrder { session_id, status } => {
                self.reconciler.mark_order(&session_id, status).await?;
            }
            WebhookAction::EndSubscription { customer_id } => {
                self.entitlements.demote_customer(&customer_id).await?;
            }
            WebhookAction::Ignore => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::BillingEmailService;
    use crate::identity::IdentitySync;
    use crate::models::NewUser;
    use crate::provider::SessionPaymentStatus;
    use crate::store::InMemoryStore;
    use crate::testing::{checkout_session, FakePaymentProvider};
    use nexo_shared::Tier;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn handler() -> (WebhookHandler, InMemoryStore) {
        let store = InMemoryStore::new();
        let entitlements = EntitlementService::new(Arc::new(store.clone()), IdentitySync::disabled());
        let reconciler = SessionReconciler::new(
            Arc::new(FakePaymentProvider::new()),
            entitlements.clone(),
            BillingEmailService::disabled(),
        );
        (WebhookHandler::new(reconciler, entitlements, SECRET), store)
    }

    #[test]
    fn accepts_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        assert!(verify_signature(payload, &sign(payload, now), SECRET, now + 10).is_ok());
    }

    #[test]
    fn accepts_any_matching_v1() {
        let payload = "{}";
        let now = 1_700_000_000;
        let header = format!("{},v1=deadbeef", sign(payload, now));
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn rejects_tampered_stale_or_malformed() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign(payload, now);

        assert!(verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, now).is_err());
        assert!(verify_signature(payload, &header, SECRET, now + SIGNATURE_TOLERANCE_SECS + 1).is_err());
        assert!(verify_signature(payload, &header, "whsec_other", now).is_err());
        assert!(verify_signature(payload, "v1=abcd", SECRET, now).is_err());
        assert!(verify_signature(payload, &format!("t={}", now), SECRET, now).is_err());
    }

    #[tokio::test]
    async fn duplicate_delivery_is_processed_once() {
        let (handler, store) = handler();
        let session = checkout_session("cs_hook", "hook@example.com", Tier::Pro, SessionPaymentStatus::Paid);

        handler
            .handle_action("evt_1", "checkout.session.completed", WebhookAction::Fulfill(session.clone()))
            .await
            .unwrap();
        handler
            .handle_action("evt_1", "checkout.session.completed", WebhookAction::Fulfill(session))
            .await
            .unwrap();

        assert_eq!(store.order_count().await, 1);
        let user = store.find_user_by_email("hook@example.com").await.unwrap().unwrap();
        assert_eq!(user.tier(), Tier::Pro);
    }

    #[tokio::test]
    async fn async_failure_rejects_pending_order() {
        let (handler, store) = handler();
        let session = checkout_session("cs_async", "slow@example.com", Tier::Starter, SessionPaymentStatus::Unpaid);

        handler
            .handle_action("evt_a", "checkout.session.completed", WebhookAction::RecordPending(session))
            .await
            .unwrap();
        handler
            .handle_action(
                "evt_b",
                "checkout.session.async_payment_failed",
                WebhookAction::CloseOrder {
                    session_id: "cs_async".to_string(),
                    status: OrderStatus::Rejected,
                },
            )
            .await
            .unwrap();

        let order = store.find_order_by_session("cs_async").await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Rejected);
        let user = store.find_user_by_email("slow@example.com").await.unwrap().unwrap();
        assert_eq!(user.tier(), Tier::Free);
    }

    #[tokio::test]
    async fn subscription_end_demotes_customer() {
        let (handler, store) = handler();
        let (user, _) = store
            .create_user_if_absent(&NewUser {
                stripe_customer_id: Some("cus_9".to_string()),
                ..NewUser::free("sub@example.com")
            })
            .await
            .unwrap();
        store.raise_user_tier(user.id, Tier::Operator).await.unwrap();

        handler
            .handle_action(
                "evt_sub",
                "customer.subscription.deleted",
                WebhookAction::EndSubscription {
                    customer_id: "cus_9".to_string(),
                },
            )
            .await
            .unwrap();

        let user = store.find_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(user.tier(), Tier::Free);
    }

    #[tokio::test]
    async fn failed_event_can_be_retried() {
        let (handler, store) = handler();
        let mut session = checkout_session("cs_bad", "bad@example.com", Tier::Pro, SessionPaymentStatus::Paid);
        session.metadata.remove("tier");

        assert!(handler
            .handle_action("evt_bad", "checkout.session.completed", WebhookAction::Fulfill(session.clone()))
            .await
            .is_err());

        session.metadata.insert("tier".to_string(), "2".to_string());
        handler
            .handle_action("evt_bad", "checkout.session.completed", WebhookAction::Fulfill(session))
            .await
            .unwrap();
        assert_eq!(store.order_count().await, 1);
    }
}
