//! Checkout success-page routes
//!
//! The success page polls these while the Stripe webhook may or may not have
//! arrived. Both paths converge on the same order and tier.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{enforce_rate_limit, require_param, ApiResponse};
use crate::{
    error::ApiResult,
    extract::{ApiJson, ApiQuery, ClientIp},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoResponse {
    tier: u8,
    tier_name: &'static str,
    user_email: String,
    needs_account_creation: bool,
}

/// GET /api/checkout/session-info?sessionId=
pub async fn session_info(
    State(state): State<AppState>,
    client: ClientIp,
    ApiQuery(query): ApiQuery<SessionQuery>,
) -> ApiResult<Json<ApiResponse<SessionInfoResponse>>> {
    enforce_rate_limit(&state, &client, "session_info", state.config.rate_limits.checkout).await?;
    let session_id = require_param(query.session_id.as_deref(), "sessionId")?;

    let info = state.billing.reconciler.get_session_info(session_id).await?;
    Ok(ApiResponse::ok(SessionInfoResponse {
        tier: info.tier.level(),
        tier_name: info.tier.name(),
        user_email: info.user_email,
        needs_account_creation: info.needs_account_creation,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    tier: u8,
    tier_name: &'static str,
    order_id: Uuid,
    order_created: bool,
}

/// POST /api/checkout/reconcile
pub async fn reconcile(
    State(state): State<AppState>,
    client: ClientIp,
    ApiJson(req): ApiJson<ReconcileRequest>,
) -> ApiResult<Json<ApiResponse<ReconcileResponse>>> {
    enforce_rate_limit(&state, &client, "reconcile", state.config.rate_limits.checkout).await?;
    let session_id = require_param(req.session_id.as_deref(), "sessionId")?;

    let outcome = state
        .billing
        .reconciler
        .reconcile_from_session(session_id)
        .await?;
    let tier = outcome.user.tier();
    Ok(ApiResponse::ok(ReconcileResponse {
        tier: tier.level(),
        tier_name: tier.name(),
        order_id: outcome.order.id,
        order_created: outcome.order_created,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    processed: bool,
    order_id: Option<Uuid>,
}

/// GET /api/checkout/verify?sessionId=
pub async fn verify(
    State(state): State<AppState>,
    client: ClientIp,
    ApiQuery(query): ApiQuery<SessionQuery>,
) -> ApiResult<Json<ApiResponse<VerifyResponse>>> {
    enforce_rate_limit(&state, &client, "verify_payment", state.config.rate_limits.checkout).await?;
    let session_id = require_param(query.session_id.as_deref(), "sessionId")?;

    let verification = state.billing.reconciler.verify_processed(session_id).await?;
    Ok(ApiResponse::ok(VerifyResponse {
        processed: verification.processed,
        order_id: verification.order_id,
    }))
}
