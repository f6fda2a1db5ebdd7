//! Activation code routes

use axum::{
    extract::{Extension, State},
    Json,
};
use nexo_billing::{BillingError, Redeemer};
use serde::{Deserialize, Serialize};

use super::{enforce_rate_limit, require_param, ApiResponse};
use crate::{
    auth::AuthUser,
    error::ApiResult,
    extract::{ApiJson, ApiQuery, ClientIp},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tier: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tier_name: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ValidateResponse {
    fn invalid(error: impl ToString) -> Self {
        Self {
            valid: false,
            code: None,
            tier: None,
            tier_name: None,
            error: Some(error.to_string()),
        }
    }
}

/// GET /api/activation-codes/validate?code=
pub async fn validate(
    State(state): State<AppState>,
    client: ClientIp,
    ApiQuery(query): ApiQuery<ValidateQuery>,
) -> ApiResult<Json<ApiResponse<ValidateResponse>>> {
    enforce_rate_limit(&state, &client, "validate_code", state.config.rate_limits.validate).await?;
    let Ok(code) = require_param(query.code.as_deref(), "code") else {
        return Ok(ApiResponse::ok(ValidateResponse::invalid("code is required")));
    };

    let response = match state.billing.ledger.validate(code).await {
        Ok(validation) => ValidateResponse {
            valid: true,
            code: Some(validation.code),
            tier: Some(validation.tier.level()),
            tier_name: Some(validation.tier_name),
            error: None,
        },
        Err(e @ (BillingError::InvalidFormat | BillingError::NotFound(_) | BillingError::Expired)) => {
            ValidateResponse::invalid(e)
        }
        Err(e) => return Err(e.into()),
    };
    Ok(ApiResponse::ok(response))
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResponse {
    tier: u8,
    tier_name: &'static str,
    granted_tier: u8,
    use_count: i32,
}

/// POST /api/activation-codes/redeem
pub async fn redeem(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    client: ClientIp,
    ApiJson(req): ApiJson<RedeemRequest>,
) -> ApiResult<Json<ApiResponse<RedeemResponse>>> {
    enforce_rate_limit(&state, &client, "redeem_code", state.config.rate_limits.redeem).await?;

    let redemption = state
        .billing
        .ledger
        .redeem(
            &req.code,
            Redeemer {
                email: &auth_user.email,
                name: auth_user.name.as_deref(),
                auth_user_id: Some(&auth_user.auth_user_id),
            },
        )
        .await?;

    Ok(ApiResponse::ok(RedeemResponse {
        tier: redemption.tier.level(),
        tier_name: redemption.tier.name(),
        granted_tier: redemption.granted.level(),
        use_count: redemption.use_count,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCodeResponse {
    code: String,
    tier: u8,
    tier_name: &'static str,
    email: String,
}

/// GET /api/activation-codes/by-session?sessionId=
pub async fn by_session(
    State(state): State<AppState>,
    client: ClientIp,
    ApiQuery(query): ApiQuery<SessionQuery>,
) -> ApiResult<Json<ApiResponse<IssuedCodeResponse>>> {
    enforce_rate_limit(&state, &client, "code_by_session", state.config.rate_limits.checkout).await?;
    let session_id = require_param(query.session_id.as_deref(), "sessionId")?;

    let issued = state.billing.ledger.fetch_by_session(session_id).await?;
    Ok(ApiResponse::ok(IssuedCodeResponse {
        code: issued.code,
        tier: issued.tier.level(),
        tier_name: issued.tier_name,
        email: issued.email,
    }))
}
