//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use nexo_billing::BillingError;
use serde::Serialize;

use super::ApiResponse;
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    received: bool,
}

/// POST /api/webhooks/stripe
///
/// Errors after a valid signature return 5xx so Stripe redelivers; the
/// event claim makes redelivery safe.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<ApiResponse<WebhookResponse>>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiError::WebhookSignatureInvalid)?;

    let event = state.billing.webhooks.verify_event(&body, signature)?;
    let event_id = event.id.to_string();

    match state.billing.webhooks.handle_event(event).await {
        Ok(()) => {}
        Err(BillingError::WebhookEventNotSupported(detail)) => {
            tracing::warn!(event_id = %event_id, detail = %detail, "Unsupported webhook payload acknowledged");
        }
        Err(e) => {
            tracing::error!(event_id = %event_id, error = %e, "Webhook processing failed");
            return Err(e.into());
        }
    }

    Ok(ApiResponse::ok(WebhookResponse { received: true }))
}
