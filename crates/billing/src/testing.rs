//! In-process fakes for the external providers

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nexo_shared::Tier;

use crate::error::{BillingError, BillingResult};
use crate::identity::IdentityProvider;
use crate::models::normalize_email;
use crate::provider::{
    CheckoutSessionSnapshot, PaymentProvider, SessionPaymentStatus, SessionStatus,
};

/// Build a checkout session snapshot with the usual metadata
pub fn checkout_session(
    id: &str,
    email: &str,
    tier: Tier,
    status: SessionPaymentStatus,
) -> CheckoutSessionSnapshot {
    let mut metadata = HashMap::new();
    metadata.insert("tier".to_string(), tier.level().to_string());
    metadata.insert("user_email".to_string(), email.to_string());
    CheckoutSessionSnapshot {
        id: id.to_string(),
        status: match status {
            SessionPaymentStatus::Unpaid => SessionStatus::Open,
            _ => SessionStatus::Complete,
        },
        payment_status: status,
        customer_email: Some(email.to_string()),
        customer_name: None,
        customer_id: Some("cus_test".to_string()),
        metadata,
        amount_total: Some(4900),
        currency: Some("usd".to_string()),
        subscription_id: None,
    }
}

#[derive(Default)]
struct PaymentState {
    sessions: HashMap<String, CheckoutSessionSnapshot>,
    subscriptions: HashMap<String, Vec<String>>,
    cancelled: Vec<String>,
    unavailable: bool,
}

#[derive(Clone, Default)]
pub struct FakePaymentProvider {
    state: Arc<Mutex<PaymentState>>,
}

impl FakePaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, session: CheckoutSessionSnapshot) {
        if let Ok(mut state) = self.state.lock() {
            state.sessions.insert(session.id.clone(), session);
        }
    }

    pub fn add_subscription(&self, customer_id: &str, subscription_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .subscriptions
                .entry(customer_id.to_string())
                .or_default()
                .push(subscription_id.to_string());
        }
    }

    /// Make every call fail as if Stripe were down
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.cancelled.clone())
            .unwrap_or_default()
    }

    fn state(&self) -> BillingResult<std::sync::MutexGuard<'_, PaymentState>> {
        let state = self
            .state
            .lock()
            .map_err(|_| BillingError::Internal("fake provider poisoned".to_string()))?;
        if state.unavailable {
            return Err(BillingError::StripeApi("service unavailable".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl PaymentProvider for FakePaymentProvider {
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<Option<CheckoutSessionSnapshot>> {
        Ok(self.state()?.sessions.get(session_id).cloned())
    }

    async fn list_active_subscriptions(&self, customer_id: &str) -> BillingResult<Vec<String>> {
        Ok(self
            .state()?
            .subscriptions
            .get(customer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let mut state = self.state()?;
        for subs in state.subscriptions.values_mut() {
            subs.retain(|s| s != subscription_id);
        }
        state.cancelled.push(subscription_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct IdentityState {
    accounts: HashMap<String, String>,
    updates: Vec<(String, Tier)>,
    failing: bool,
}

/// Records metadata updates instead of calling Supabase
#[derive(Clone, Default)]
pub struct FakeIdentityProvider {
    state: Arc<Mutex<IdentityState>>,
}

impl FakeIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, email: &str, identity_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .accounts
                .insert(normalize_email(email), identity_id.to_string());
        }
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.failing = failing;
        }
    }

    /// `(identity id, tier)` pairs in the order they were written
    pub fn updates(&self) -> Vec<(String, Tier)> {
        self.state
            .lock()
            .map(|s| s.updates.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn find_user_id_by_email(&self, email: &str) -> BillingResult<Option<String>> {
        let state = self
            .state
            .lock()
            .map_err(|_| BillingError::Internal("fake provider poisoned".to_string()))?;
        if state.failing {
            return Err(BillingError::IdentityProvider("unavailable".to_string()));
        }
        Ok(state.accounts.get(&normalize_email(email)).cloned())
    }

    async fn update_tier_metadata(&self, identity_id: &str, tier: Tier) -> BillingResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BillingError::Internal("fake provider poisoned".to_string()))?;
        if state.failing {
            return Err(BillingError::IdentityProvider("unavailable".to_string()));
        }
        state.updates.push((identity_id.to_string(), tier));
        Ok(())
    }
}
