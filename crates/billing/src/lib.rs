// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries Stripe errors by value
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Nexo Billing Module
//!
//! Tier entitlements and checkout reconciliation.
//!
//! ## Features
//!
//! - **Tier Resolution**: max-merge of stored, code-granted and purchased tiers
//! - **Activation Codes**: validate, redeem and issue `NEXO-XXXX-XXXX` codes
//! - **Session Reconciliation**: webhook and polling paths converge on one order per checkout session
//! - **Identity Sync**: best-effort mirror of the tier into Supabase user metadata
//! - **Coupons**: percent/fixed discounts with redemption limits
//! - **Webhooks**: signature-verified, idempotent Stripe event handling
//! - **Invariants**: consistency checks between users, entitlements, orders and codes
//! - **Quiz**: plan recommendation from versioned configuration

pub mod activation;
pub mod client;
pub mod coupon;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod identity;
pub mod invariants;
pub mod models;
pub mod provider;
pub mod recommendation;
pub mod reconcile;
pub mod resolver;
pub mod store;
pub mod webhooks;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;


// Activation codes
pub use activation::{
    generate_code, normalize_code, ActivationLedger, CodeValidation, IssuedCode, Redeemer,
    Redemption,
};

// Client
pub use client::{StripeClient, StripeConfig};

// Coupons
pub use coupon::{CouponQuote, CouponService, DiscountType};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Entitlements
pub use entitlement::{EntitlementService, SubscriptionCancellation, TierChange};

// Error
pub use error::{BillingError, BillingResult};

// Identity
pub use identity::{IdentityProvider, IdentitySync, SupabaseAdminClient};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{
    normalize_email, ActivationCodeRecord, CouponRecord, EntitlementRecord, OrderRecord,
    OrderStatus, UserRecord,
};

// Payment provider
pub use provider::{
    CheckoutSessionSnapshot, PaymentProvider, SessionPaymentStatus, SessionStatus,
};

// Quiz
pub use recommendation::{load_quiz_config, QuizConfig, Recommendation};

// Reconciliation
pub use reconcile::{
    FulfillmentOutcome, PaymentVerification, ReconcileOutcome, SessionInfo, SessionReconciler,
    StaleOrderSweep,
};

// Resolver
pub use resolver::{TierDivergence, TierSignals};

// Store
pub use store::{EntitlementStore, InMemoryStore, PgStore};

// Webhooks
pub use webhooks::{verify_signature, WebhookAction, WebhookHandler};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub entitlements: EntitlementService,
    pub ledger: ActivationLedger,
    pub reconciler: SessionReconciler,
    pub coupons: CouponService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool, http: reqwest::Client) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();
        let identity = match SupabaseAdminClient::from_env(stripe.config().request_timeout) {
            Some(client) => IdentitySync::new(Arc::new(client)),
            None => {
                tracing::warn!("Supabase service role not configured, identity sync disabled");
                IdentitySync::disabled()
            }
        };

        Ok(Self::from_parts(
            Arc::new(PgStore::new(pool)),
            Arc::new(stripe),
            identity,
            BillingEmailService::from_env(http),
            webhook_secret,
        ))
    }

    /// Create a new billing service with explicit collaborators
    pub fn from_parts(
        store: Arc<dyn EntitlementStore>,
        payments: Arc<dyn PaymentProvider>,
        identity: IdentitySync,
        email: BillingEmailService,
        webhook_secret: impl Into<String>,
    ) -> Self {
        let entitlements = EntitlementService::new(store.clone(), identity);
        let reconciler = SessionReconciler::new(payments, entitlements.clone(), email);

        Self {
            ledger: ActivationLedger::new(entitlements.clone()),
            coupons: CouponService::new(store),
            webhooks: WebhookHandler::new(reconciler.clone(), entitlements.clone(), webhook_secret),
            reconciler,
            entitlements,
        }
    }
}
