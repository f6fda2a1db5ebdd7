//! Coupon validation

use axum::{extract::State, Json};
use nexo_billing::BillingError;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{enforce_rate_limit, require_param, ApiResponse};
use crate::{
    error::{ApiError, ApiResult},
    extract::{ApiQuery, ClientIp},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CouponQuery {
    code: Option<String>,
    /// Price in cents
    amount: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    discount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    discounted_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// GET /api/coupons/validate?code=&amount=
pub async fn validate(
    State(state): State<AppState>,
    client: ClientIp,
    ApiQuery(query): ApiQuery<CouponQuery>,
) -> ApiResult<Json<ApiResponse<CouponResponse>>> {
    enforce_rate_limit(&state, &client, "validate_coupon", state.config.rate_limits.validate).await?;
    let code = require_param(query.code.as_deref(), "code")?;
    let amount = query
        .amount
        .ok_or_else(|| ApiError::Validation("amount is required".to_string()))?;

    let response = match state
        .billing
        .coupons
        .validate(code, amount, OffsetDateTime::now_utc())
        .await
    {
        Ok(quote) => CouponResponse {
            valid: true,
            discount: Some(quote.discount),
            discounted_amount: Some(quote.discounted_amount),
            error: None,
        },
        Err(e @ (BillingError::NotFound(_) | BillingError::CouponUnavailable(_))) => CouponResponse {
            valid: false,
            discount: None,
            discounted_amount: None,
            error: Some(e.to_string()),
        },
        Err(e) => return Err(e.into()),
    };
    Ok(ApiResponse::ok(response))
}
