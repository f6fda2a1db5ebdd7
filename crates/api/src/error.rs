//! API error type and the `{success: false, error, message}` envelope

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use nexo_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid activation code format")]
    InvalidFormat,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Activation code has expired")]
    Expired,

    #[error("Payment has not been completed")]
    NotPaid,

    #[error("Authentication required")]
    Unauthorized,

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("Too many requests")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Service not configured: {0}")]
    NotConfigured(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InvalidFormat | ApiError::WebhookSignatureInvalid => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Expired => StatusCode::GONE,
            ApiError::NotPaid => StatusCode::PAYMENT_REQUIRED,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Provider(_) | ApiError::Database(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable kind
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION",
            ApiError::InvalidFormat => "INVALID_FORMAT",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Expired => "EXPIRED",
            ApiError::NotPaid => "NOT_PAID",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::WebhookSignatureInvalid => "WEBHOOK_SIGNATURE_INVALID",
            ApiError::Provider(_) => "PROVIDER_ERROR",
            ApiError::NotConfigured(_) => "NOT_CONFIGURED",
            ApiError::Database(_) | ApiError::Internal(_) => "INTERNAL",
        }
    }

    /// Message shown to the caller. Server-side details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ApiError::Provider(_) => "A payment or identity provider is unavailable".to_string(),
            ApiError::NotConfigured(_) => "Service temporarily unavailable".to_string(),
            ApiError::Database(_) | ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::InvalidFormat => ApiError::InvalidFormat,
            BillingError::NotFound(what) => ApiError::NotFound(what),
            BillingError::Expired => ApiError::Expired,
            BillingError::NotPaid(_) => ApiError::NotPaid,
            BillingError::InvalidInput(msg) | BillingError::CouponUnavailable(msg) => {
                ApiError::Validation(msg)
            }
            BillingError::WebhookSignatureInvalid => ApiError::WebhookSignatureInvalid,
            BillingError::WebhookEventNotSupported(msg) => ApiError::Validation(msg),
            BillingError::NotConfigured(msg) => ApiError::NotConfigured(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Internal(msg) => ApiError::Internal(msg),
            e @ (BillingError::StripeApi(_)
            | BillingError::IdentityProvider(_)
            | BillingError::ProviderTimeout(_)
            | BillingError::Email(_)) => ApiError::Provider(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Database(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "Request rejected");
        }

        let body = Json(json!({
            "success": false,
            "error": self.code(),
            "message": self.public_message(),
        }));
        let mut response = (status, body).into_response();

        if let ApiError::RateLimited {
            retry_after_seconds,
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_statuses() {
        assert_eq!(
            ApiError::from(BillingError::InvalidFormat).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(BillingError::NotFound("Activation code".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(BillingError::StripeApi("boom".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(BillingError::WebhookSignatureInvalid).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn provider_details_are_not_exposed() {
        let err = ApiError::from(BillingError::StripeApi("sk_live leaked".into()));
        assert!(!err.public_message().contains("sk_live"));
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited {
            retry_after_seconds: 42,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "42");
    }
}
