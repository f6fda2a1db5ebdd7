//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Activation code does not match `NEXO-XXXX-XXXX`
    #[error("Invalid activation code format")]
    InvalidFormat,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Activation code has expired")]
    Expired,

    #[error("Checkout session {0} has not been paid")]
    NotPaid(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Coupon unavailable: {0}")]
    CouponUnavailable(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Identity provider error: {0}")]
    IdentityProvider(String),

    #[error("{0} did not respond in time")]
    ProviderTimeout(&'static str),

    #[error("Email delivery error: {0}")]
    Email(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Billing not configured: {0}")]
    NotConfigured(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors caused by an external provider rather than the caller or our store
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            BillingError::StripeApi(_)
                | BillingError::IdentityProvider(_)
                | BillingError::ProviderTimeout(_)
                | BillingError::Email(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}
