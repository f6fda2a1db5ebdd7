//! Checkout session reconciliation
//!
//! Two paths converge on the same state for a paid checkout session: the
//! Stripe webhook ([`SessionReconciler::fulfill_checkout`]) and the polling
//! fallback the success page calls ([`SessionReconciler::reconcile_from_session`]).
//! Either may arrive first, both may arrive, either may be retried. The
//! order row keyed by the session id is the only duplicate guard and the
//! tier merge is `max`, so no ordering between the two is needed.

use std::sync::Arc;

use nexo_shared::Tier;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::activation::ActivationLedger;
use crate::coupon::CouponService;
use crate::email::BillingEmailService;
use crate::entitlement::EntitlementService;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    ActivationCodeRecord, NewOrder, NewUser, OrderRecord, OrderStatus, UserRecord,
};
use crate::provider::{CheckoutSessionSnapshot, PaymentProvider};
use crate::resolver;
use crate::store::EntitlementStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub tier: Tier,
    pub user_email: String,
    /// No user yet, or the user never signed in
    pub needs_account_creation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentVerification {
    pub processed: bool,
    pub order_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub user: UserRecord,
    pub tier: Tier,
    pub order: OrderRecord,
    /// `false` when the order already existed
    pub order_created: bool,
}

#[derive(Debug, Clone)]
pub struct FulfillmentOutcome {
    pub reconciled: ReconcileOutcome,
    pub activation_code: ActivationCodeRecord,
}

/// Result of one pass over stale pending orders
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleOrderSweep {
    pub checked: usize,
    pub fulfilled: usize,
    pub cancelled: usize,
    pub still_pending: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SessionReconciler {
    store: Arc<dyn EntitlementStore>,
    payments: Arc<dyn PaymentProvider>,
    entitlements: EntitlementService,
    ledger: ActivationLedger,
    coupons: CouponService,
    email: BillingEmailService,
}

fn required_tier(session: &CheckoutSessionSnapshot) -> BillingResult<Tier> {
    session.tier().ok_or_else(|| {
        BillingError::InvalidInput(format!("checkout session {} has no tier", session.id))
    })
}

fn required_email(session: &CheckoutSessionSnapshot) -> BillingResult<String> {
    session.email().ok_or_else(|| {
        BillingError::InvalidInput(format!("checkout session {} has no email", session.id))
    })
}

impl SessionReconciler {
    pub fn new(
        payments: Arc<dyn PaymentProvider>,
        entitlements: EntitlementService,
        email: BillingEmailService,
    ) -> Self {
        let store = entitlements.store().clone();
        Self {
            coupons: CouponService::new(store.clone()),
            ledger: ActivationLedger::new(entitlements.clone()),
            store,
            payments,
            entitlements,
            email,
        }
    }

    pub fn payments(&self) -> &Arc<dyn PaymentProvider> {
        &self.payments
    }

    async fn paid_session(&self, session_id: &str) -> BillingResult<CheckoutSessionSnapshot> {
        let session = self
            .payments
            .retrieve_checkout_session(session_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("Checkout session".to_string()))?;
        if !session.is_paid() {
            return Err(BillingError::NotPaid(session_id.to_string()));
        }
        Ok(session)
    }

    /// What the success page needs to know about a paid session. Read-only.
    pub async fn get_session_info(&self, session_id: &str) -> BillingResult<SessionInfo> {
        let session = self.paid_session(session_id).await?;
        let session_tier = required_tier(&session)?;
        let email = required_email(&session)?;

        let user = self.store.find_user_by_email(&email).await?;
        let tier = match &user {
            Some(u) => resolver::reconcile_with_session(session_id, u.tier(), session_tier),
            None => session_tier,
        };

        Ok(SessionInfo {
            tier,
            user_email: email,
            needs_account_creation: !user.is_some_and(|u| u.auth_user_id.is_some()),
        })
    }

    /// Whether an approved order exists for the session
    pub async fn verify_processed(&self, session_id: &str) -> BillingResult<PaymentVerification> {
        let order = self.store.find_order_by_session(session_id).await?;
        Ok(match order {
            Some(order) if order.status() == OrderStatus::Approved => PaymentVerification {
                processed: true,
                order_id: Some(order.id),
            },
            _ => PaymentVerification {
                processed: false,
                order_id: None,
            },
        })
    }

    /// Polling fallback: apply a paid session without waiting for the
    /// webhook. Issues the activation code as well, since the webhook may
    /// never arrive. Idempotent.
    pub async fn reconcile_from_session(&self, session_id: &str) -> BillingResult<ReconcileOutcome> {
        let session = self.paid_session(session_id).await?;
        Ok(self.fulfill_checkout(&session).await?.reconciled)
    }

    /// Apply the session, issue its activation code and send the
    /// confirmation email once. Shared by the webhook, polling and sweep
    /// paths.
    pub async fn fulfill_checkout(
        &self,
        session: &CheckoutSessionSnapshot,
    ) -> BillingResult<FulfillmentOutcome> {
        if !session.is_paid() {
            return Err(BillingError::NotPaid(session.id.clone()));
        }
        let reconciled = self.apply_paid_session(session).await?;
        let (activation_code, issued) = self
            .ledger
            .issue_for_order(&reconciled.order, None)
            .await?;

        if issued {
            self.email.notify_purchase(
                &reconciled.user.email,
                reconciled.order.tier(),
                Some(&activation_code.code),
            );
        }

        Ok(FulfillmentOutcome {
            reconciled,
            activation_code,
        })
    }

    /// Retrieve and fulfill a session by id
    pub async fn fulfill_session(&self, session_id: &str) -> BillingResult<FulfillmentOutcome> {
        let session = self.paid_session(session_id).await?;
        self.fulfill_checkout(&session).await
    }

    async fn apply_paid_session(
        &self,
        session: &CheckoutSessionSnapshot,
    ) -> BillingResult<ReconcileOutcome> {
        let tier = required_tier(session)?;
        let email = required_email(session)?;

        let new_user = NewUser {
            email: email.clone(),
            name: session.customer_name.clone(),
            tier,
            stripe_customer_id: session.customer_id.clone(),
        };
        let (user, created) = self.store.create_user_if_absent(&new_user).await?;

        let user = if created {
            tracing::info!(user_id = %user.id, tier = %tier, session_id = %session.id, "Created user from checkout");
            if tier.is_paid() {
                self.store.upsert_entitlement(user.id, tier).await?;
            }
            self.entitlements
                .identity()
                .mirror_tier(&user.email, None, tier);
            user
        } else {
            if let Some(customer_id) = &session.customer_id {
                self.store.link_stripe_customer(user.id, customer_id).await?;
            }
            resolver::reconcile_with_session(&session.id, user.tier(), tier);
            self.entitlements.raise_tier(&user, tier).await?.user
        };

        let new_order = NewOrder {
            external_session_id: session.id.clone(),
            user_id: user.id,
            tier,
            amount_cents: session.amount_cents(),
            currency: session.currency_or_default(),
            status: OrderStatus::Approved,
            coupon_code: session.coupon_code(),
        };
        let (mut order, order_created) = self.store.create_order_if_absent(&new_order).await?;

        if order_created {
            tracing::info!(order_id = %order.id, session_id = %session.id, "Recorded order");
            if let Some(code) = &new_order.coupon_code {
                self.coupons.redeem(code, OffsetDateTime::now_utc()).await?;
            }
        } else if let Some(approved) = self
            .store
            .transition_order(&session.id, OrderStatus::Approved)
            .await?
        {
            tracing::info!(order_id = %approved.id, session_id = %session.id, "Approved pending order");
            if let Some(code) = &approved.coupon_code {
                self.coupons.redeem(code, OffsetDateTime::now_utc()).await?;
            }
            order = approved;
        } else {
            tracing::debug!(session_id = %session.id, status = %order.status, "Order already recorded");
        }

        Ok(ReconcileOutcome {
            tier: user.tier(),
            user,
            order,
            order_created,
        })
    }

    /// Record an order whose payment has not settled yet (async payment
    /// methods). No tier is granted.
    pub async fn record_pending(
        &self,
        session: &CheckoutSessionSnapshot,
    ) -> BillingResult<OrderRecord> {
        let tier = required_tier(session)?;
        let email = required_email(session)?;

        let new_user = NewUser {
            name: session.customer_name.clone(),
            stripe_customer_id: session.customer_id.clone(),
            ..NewUser::free(email)
        };
        let (user, _) = self.store.create_user_if_absent(&new_user).await?;

        let (order, created) = self
            .store
            .create_order_if_absent(&NewOrder {
                external_session_id: session.id.clone(),
                user_id: user.id,
                tier,
                amount_cents: session.amount_cents(),
                currency: session.currency_or_default(),
                status: OrderStatus::Pending,
                coupon_code: session.coupon_code(),
            })
            .await?;
        if created {
            tracing::info!(order_id = %order.id, session_id = %session.id, "Recorded pending order");
        }
        Ok(order)
    }

    /// Close an open order as `REJECTED` or `CANCELLED`. Terminal orders are
    /// left alone and `None` is returned.
    pub async fn mark_order(
        &self,
        session_id: &str,
        status: OrderStatus,
    ) -> BillingResult<Option<OrderRecord>> {
        if !matches!(status, OrderStatus::Rejected | OrderStatus::Cancelled) {
            return Err(BillingError::InvalidInput(format!(
                "orders can only be marked REJECTED or CANCELLED, not {}",
                status
            )));
        }
        let updated = self.store.transition_order(session_id, status).await?;
        match &updated {
            Some(order) => {
                tracing::info!(order_id = %order.id, session_id = %session_id, status = %status, "Closed order")
            }
            None => {
                tracing::debug!(session_id = %session_id, status = %status, "No open order to close")
            }
        }
        Ok(updated)
    }

    /// Re-check pending orders older than `created_before` against Stripe.
    /// Covers the case where both the webhook and the polling call were lost.
    pub async fn reconcile_stale_orders(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<StaleOrderSweep> {
        let orders = self
            .store
            .list_stale_pending_orders(created_before, limit)
            .await?;
        let mut sweep = StaleOrderSweep {
            checked: orders.len(),
            ..StaleOrderSweep::default()
        };

        for order in orders {
            let session_id = order.external_session_id.as_str();
            let still_open = match self.payments.retrieve_checkout_session(session_id).await {
                Ok(Some(session)) if session.is_paid() => {
                    match self.fulfill_checkout(&session).await {
                        Ok(_) => {
                            sweep.fulfilled += 1;
                            false
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %session_id, error = %e, "Failed to fulfill stale order");
                            sweep.failed += 1;
                            true
                        }
                    }
                }
                Ok(Some(session)) if session.is_expired() => {
                    self.mark_order(session_id, OrderStatus::Cancelled).await?;
                    sweep.cancelled += 1;
                    false
                }
                Ok(Some(_)) => {
                    sweep.still_pending += 1;
                    true
                }
                Ok(None) => {
                    self.mark_order(session_id, OrderStatus::Cancelled).await?;
                    sweep.cancelled += 1;
                    false
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to retrieve session for stale order");
                    sweep.failed += 1;
                    true
                }
            };

            // Rotate to the back of the queue so unpaid sessions cannot
            // fill every batch
            if still_open {
                self.store.touch_order(session_id).await?;
            }
        }

        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentitySync;
    use crate::provider::{SessionPaymentStatus, SessionStatus};
    use crate::store::InMemoryStore;
    use crate::testing::{checkout_session, FakePaymentProvider};

    fn reconciler() -> (SessionReconciler, InMemoryStore, FakePaymentProvider) {
        let store = InMemoryStore::new();
        let payments = FakePaymentProvider::new();
        let entitlements = EntitlementService::new(Arc::new(store.clone()), IdentitySync::disabled());
        let reconciler = SessionReconciler::new(
            Arc::new(payments.clone()),
            entitlements,
            BillingEmailService::disabled(),
        );
        (reconciler, store, payments)
    }

    #[tokio::test]
    async fn unknown_session_is_not_found_and_unprocessed() {
        let (r, _, _) = reconciler();
        assert!(matches!(
            r.get_session_info("cs_missing").await,
            Err(BillingError::NotFound(_))
        ));
        assert_eq!(
            r.verify_processed("cs_missing").await.unwrap(),
            PaymentVerification {
                processed: false,
                order_id: None
            }
        );
    }

    #[tokio::test]
    async fn unpaid_session_is_rejected() {
        let (r, store, payments) = reconciler();
        payments.add_session(checkout_session(
            "cs_unpaid",
            "a@example.com",
            Tier::Pro,
            SessionPaymentStatus::Unpaid,
        ));
        assert!(matches!(
            r.get_session_info("cs_unpaid").await,
            Err(BillingError::NotPaid(_))
        ));
        assert!(matches!(
            r.reconcile_from_session("cs_unpaid").await,
            Err(BillingError::NotPaid(_))
        ));
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn session_info_for_new_buyer() {
        let (r, _, payments) = reconciler();
        payments.add_session(checkout_session(
            "cs_new",
            "New@Example.com",
            Tier::Starter,
            SessionPaymentStatus::Paid,
        ));
        let info = r.get_session_info("cs_new").await.unwrap();
        assert_eq!(info.tier, Tier::Starter);
        assert_eq!(info.user_email, "new@example.com");
        assert!(info.needs_account_creation);
    }

    #[tokio::test]
    async fn stored_tier_wins_when_higher() {
        let (r, store, payments) = reconciler();
        let (user, _) = store
            .create_user_if_absent(&NewUser::free("pro@example.com"))
            .await
            .unwrap();
        store.raise_user_tier(user.id, Tier::Operator).await.unwrap();
        store.link_auth_user(user.id, "auth-1").await.unwrap();
        payments.add_session(checkout_session(
            "cs_pro",
            "pro@example.com",
            Tier::Pro,
            SessionPaymentStatus::Paid,
        ));

        let info = r.get_session_info("cs_pro").await.unwrap();
        assert_eq!(info.tier, Tier::Operator);
        assert!(!info.needs_account_creation);

        let outcome = r.reconcile_from_session("cs_pro").await.unwrap();
        assert_eq!(outcome.tier, Tier::Operator);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (r, store, payments) = reconciler();
        payments.add_session(checkout_session(
            "cs_twice",
            "twice@example.com",
            Tier::Pro,
            SessionPaymentStatus::Paid,
        ));

        let first = r.reconcile_from_session("cs_twice").await.unwrap();
        let second = r.reconcile_from_session("cs_twice").await.unwrap();

        assert!(first.order_created);
        assert!(!second.order_created);
        assert_eq!(first.order.id, second.order.id);
        assert_eq!(store.order_count().await, 1);
        assert_eq!(store.user_count().await, 1);

        let verification = r.verify_processed("cs_twice").await.unwrap();
        assert!(verification.processed);
        assert_eq!(verification.order_id, Some(first.order.id));
    }

    #[tokio::test]
    async fn webhook_after_polling_issues_one_code() {
        let (r, store, payments) = reconciler();
        let session = checkout_session(
            "cs_both",
            "both@example.com",
            Tier::Operator,
            SessionPaymentStatus::Paid,
        );
        payments.add_session(session.clone());

        r.reconcile_from_session("cs_both").await.unwrap();
        let first = r.fulfill_checkout(&session).await.unwrap();
        let again = r.fulfill_checkout(&session).await.unwrap();

        assert_eq!(first.activation_code.code, again.activation_code.code);
        assert_eq!(first.activation_code.tier(), Tier::Operator);
        assert_eq!(store.order_count().await, 1);
    }

    #[tokio::test]
    async fn pending_order_is_approved_by_later_payment() {
        let (r, _, payments) = reconciler();
        let mut session = checkout_session(
            "cs_async",
            "async@example.com",
            Tier::Pro,
            SessionPaymentStatus::Unpaid,
        );
        let pending = r.record_pending(&session).await.unwrap();
        assert_eq!(pending.status(), OrderStatus::Pending);
        assert!(!r.verify_processed("cs_async").await.unwrap().processed);

        session.payment_status = SessionPaymentStatus::Paid;
        payments.add_session(session.clone());
        let outcome = r.fulfill_checkout(&session).await.unwrap();

        assert!(!outcome.reconciled.order_created);
        assert_eq!(outcome.reconciled.order.status(), OrderStatus::Approved);
        assert_eq!(outcome.reconciled.tier, Tier::Pro);
        assert!(r.verify_processed("cs_async").await.unwrap().processed);
    }

    #[tokio::test]
    async fn terminal_orders_are_not_reopened() {
        let (r, _, payments) = reconciler();
        let session = checkout_session(
            "cs_done",
            "done@example.com",
            Tier::Starter,
            SessionPaymentStatus::Paid,
        );
        payments.add_session(session);
        r.reconcile_from_session("cs_done").await.unwrap();

        assert!(r
            .mark_order("cs_done", OrderStatus::Cancelled)
            .await
            .unwrap()
            .is_none());
        assert!(r.verify_processed("cs_done").await.unwrap().processed);
    }

    #[tokio::test]
    async fn provider_outage_writes_nothing() {
        let (r, store, payments) = reconciler();
        payments.set_unavailable(true);
        let err = r.reconcile_from_session("cs_any").await.unwrap_err();
        assert!(err.is_provider_error());
        assert_eq!(store.user_count().await, 0);
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn stale_sweep_fulfills_paid_and_cancels_missing() {
        let (r, store, payments) = reconciler();
        let paid = checkout_session(
            "cs_paid_late",
            "late@example.com",
            Tier::Pro,
            SessionPaymentStatus::Unpaid,
        );
        let gone = checkout_session(
            "cs_gone",
            "gone@example.com",
            Tier::Starter,
            SessionPaymentStatus::Unpaid,
        );
        r.record_pending(&paid).await.unwrap();
        r.record_pending(&gone).await.unwrap();

        let mut settled = paid.clone();
        settled.payment_status = SessionPaymentStatus::Paid;
        payments.add_session(settled);

        let sweep = r
            .reconcile_stale_orders(OffsetDateTime::now_utc() + time::Duration::minutes(1), 10)
            .await
            .unwrap();
        assert_eq!(
            sweep,
            StaleOrderSweep {
                checked: 2,
                fulfilled: 1,
                cancelled: 1,
                still_pending: 0,
                failed: 0,
            }
        );
        let late = store.find_user_by_email("late@example.com").await.unwrap().unwrap();
        assert_eq!(late.tier(), Tier::Pro);
    }

    #[tokio::test]
    async fn polling_alone_issues_the_code() {
        let (r, store, payments) = reconciler();
        payments.add_session(checkout_session(
            "cs_no_hook",
            "nohook@example.com",
            Tier::Pro,
            SessionPaymentStatus::Paid,
        ));

        r.reconcile_from_session("cs_no_hook").await.unwrap();
        let first = r.ledger.fetch_by_session("cs_no_hook").await.unwrap();
        r.reconcile_from_session("cs_no_hook").await.unwrap();
        let second = r.ledger.fetch_by_session("cs_no_hook").await.unwrap();

        assert_eq!(first.code, second.code);
        assert_eq!(first.tier, Tier::Pro);
        assert!(r.verify_processed("cs_no_hook").await.unwrap().processed);

        let order = store.find_order_by_session("cs_no_hook").await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Approved);
    }

    #[tokio::test]
    async fn stale_sweep_moves_past_abandoned_sessions() {
        let (r, store, payments) = reconciler();
        for id in ["cs_abandoned_1", "cs_abandoned_2"] {
            let session = checkout_session(
                id,
                &format!("{}@example.com", id),
                Tier::Starter,
                SessionPaymentStatus::Unpaid,
            );
            r.record_pending(&session).await.unwrap();
            payments.add_session(session);
        }
        let mut paid = checkout_session(
            "cs_paid_newer",
            "newer@example.com",
            Tier::Pro,
            SessionPaymentStatus::Unpaid,
        );
        r.record_pending(&paid).await.unwrap();
        paid.payment_status = SessionPaymentStatus::Paid;
        paid.status = SessionStatus::Complete;
        payments.add_session(paid);

        let cutoff = OffsetDateTime::now_utc() + time::Duration::minutes(1);

        let first = r.reconcile_stale_orders(cutoff, 2).await.unwrap();
        assert_eq!(first.checked, 2);
        assert_eq!(first.still_pending, 2);

        let second = r.reconcile_stale_orders(cutoff, 2).await.unwrap();
        assert_eq!(second.fulfilled, 1);
        let buyer = store.find_user_by_email("newer@example.com").await.unwrap().unwrap();
        assert_eq!(buyer.tier(), Tier::Pro);

        let mut expired = checkout_session(
            "cs_abandoned_2",
            "cs_abandoned_2@example.com",
            Tier::Starter,
            SessionPaymentStatus::Unpaid,
        );
        expired.status = SessionStatus::Expired;
        payments.add_session(expired);

        let third = r.reconcile_stale_orders(cutoff, 2).await.unwrap();
        assert_eq!(third.cancelled, 1);
        assert_eq!(third.still_pending, 1);
        let closed = store
            .find_order_by_session("cs_abandoned_2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.status(), OrderStatus::Cancelled);
    }
}
