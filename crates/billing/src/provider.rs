//! Payment provider seam
//!
//! Checkout sessions are read through [`PaymentProvider`] so reconciliation
//! can be exercised without Stripe. The snapshot keeps only the fields the
//! reconciler uses.

use std::collections::HashMap;

use async_trait::async_trait;
use nexo_shared::Tier;
use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionId, CheckoutSessionPaymentStatus,
    CheckoutSessionStatus, CustomerId, ListSubscriptions, Subscription, SubscriptionId, SubscriptionStatusFilter,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::models::normalize_email;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
}

impl From<&CheckoutSessionPaymentStatus> for SessionPaymentStatus {
    fn from(status: &CheckoutSessionPaymentStatus) -> Self {
        match status {
            CheckoutSessionPaymentStatus::Paid => SessionPaymentStatus::Paid,
            CheckoutSessionPaymentStatus::Unpaid => SessionPaymentStatus::Unpaid,
            CheckoutSessionPaymentStatus::NoPaymentRequired => {
                SessionPaymentStatus::NoPaymentRequired
            }
        }
    }
}

/// Lifecycle of the session itself, independent of payment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Complete,
    /// Abandoned; it can no longer be paid
    Expired,
}

impl From<Option<&CheckoutSessionStatus>> for SessionStatus {
    fn from(status: Option<&CheckoutSessionStatus>) -> Self {
        match status {
            Some(CheckoutSessionStatus::Complete) => SessionStatus::Complete,
            Some(CheckoutSessionStatus::Expired) => SessionStatus::Expired,
            Some(CheckoutSessionStatus::Open) | None => SessionStatus::Open,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSessionSnapshot {
    pub id: String,
    pub status: SessionStatus,
    pub payment_status: SessionPaymentStatus,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub customer_id: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Minor units
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub subscription_id: Option<String>,
}

impl CheckoutSessionSnapshot {
    /// Only a confirmed `paid` status grants a tier
    pub fn is_paid(&self) -> bool {
        self.payment_status == SessionPaymentStatus::Paid
    }

    pub fn is_expired(&self) -> bool {
        self.status == SessionStatus::Expired
    }

    /// Tier purchased, from the `tier` metadata key
    pub fn tier(&self) -> Option<Tier> {
        self.metadata.get("tier").and_then(|v| Tier::from_metadata(v))
    }

    /// Buyer email: explicit metadata first, then what Stripe collected
    pub fn email(&self) -> Option<String> {
        ["user_email", "userEmail", "email"]
            .iter()
            .find_map(|key| self.metadata.get(*key))
            .or(self.customer_email.as_ref())
            .map(|e| normalize_email(e))
            .filter(|e| !e.is_empty())
    }

    pub fn coupon_code(&self) -> Option<String> {
        ["coupon_code", "couponCode", "coupon"]
            .iter()
            .find_map(|key| self.metadata.get(*key))
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
    }

    pub fn amount_cents(&self) -> i64 {
        self.amount_total.unwrap_or(0)
    }

    pub fn currency_or_default(&self) -> String {
        self.currency.clone().unwrap_or_else(|| "usd".to_string())
    }
}

impl From<&CheckoutSession> for CheckoutSessionSnapshot {
    fn from(session: &CheckoutSession) -> Self {
        let details = session.customer_details.as_ref();
        Self {
            id: session.id.to_string(),
            status: SessionStatus::from(session.status.as_ref()),
            payment_status: SessionPaymentStatus::from(&session.payment_status),
            customer_email: session
                .customer_email
                .clone()
                .or_else(|| details.and_then(|d| d.email.clone())),
            customer_name: details.and_then(|d| d.name.clone()),
            customer_id: session.customer.as_ref().map(|c| c.id().to_string()),
            metadata: session.metadata.clone().unwrap_or_default(),
            amount_total: session.amount_total,
            currency: session.currency.as_ref().map(|c| c.to_string()),
            subscription_id: session.subscription.as_ref().map(|s| s.id().to_string()),
        }
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// `None` when the provider has no session with this id
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<Option<CheckoutSessionSnapshot>>;

    /// Ids of the customer's active subscriptions
    async fn list_active_subscriptions(&self, customer_id: &str) -> BillingResult<Vec<String>>;

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()>;
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<Option<CheckoutSessionSnapshot>> {
        // Ids without the `cs_` prefix can never exist
        let Ok(id) = session_id.parse::<CheckoutSessionId>() else {
            return Ok(None);
        };

        let session = self
            .call_optional("checkout_session.retrieve", || {
                CheckoutSession::retrieve(self.inner(), &id, &[])
            })
            .await?;

        Ok(session.as_ref().map(CheckoutSessionSnapshot::from))
    }

    async fn list_active_subscriptions(&self, customer_id: &str) -> BillingResult<Vec<String>> {
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))?;

        let subscriptions = self
            .call("subscription.list", || {
                let params = ListSubscriptions {
                    customer: Some(customer.clone()),
                    status: Some(SubscriptionStatusFilter::Active),
                    ..Default::default()
                };
                async move { Subscription::list(self.inner(), &params).await }
            })
            .await?;

        Ok(subscriptions
            .data
            .into_iter()
            .map(|s| s.id.to_string())
            .collect())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))?;

        let cancelled = self
            .call_optional("subscription.cancel", || {
                Subscription::cancel(
                    self.inner(),
                    &id,
                    CancelSubscription {
                        cancellation_details: None,
                        invoice_now: None,
                        prorate: None,
                    },
                )
            })
            .await?;

        if cancelled.is_none() {
            tracing::info!(subscription_id = %subscription_id, "Subscription already gone at Stripe");
        }
        Ok(())
    }
}
