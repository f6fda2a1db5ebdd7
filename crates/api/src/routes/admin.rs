//! Admin routes
//!
//! Protected by `require_admin`: a configured admin email or `role = 'admin'`.

use axum::{
    extract::{Extension, State},
    Json,
};
use nexo_billing::{SubscriptionCancellation, UserRecord};
use nexo_shared::Tier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ApiResponse;
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    extract::{ApiJson, ApiPath},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SetTierRequest {
    tier: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTierResponse {
    user: UserRecord,
    previous_tier: u8,
    tier: u8,
    tier_name: &'static str,
}

/// PUT /api/admin/users/{user_id}/tier
pub async fn set_user_tier(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    ApiPath(user_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<SetTierRequest>,
) -> ApiResult<Json<ApiResponse<SetTierResponse>>> {
    let tier = Tier::from_level(req.tier)
        .ok_or_else(|| ApiError::Validation(format!("tier must be 0-3, got {}", req.tier)))?;

    let change = state.billing.entitlements.set_tier(user_id, tier).await?;
    tracing::info!(
        admin = %admin.email,
        user_id = %user_id,
        previous_tier = %change.previous,
        tier = %change.current,
        "Admin changed user tier"
    );

    Ok(ApiResponse::ok(SetTierResponse {
        previous_tier: change.previous.level(),
        tier: change.current.level(),
        tier_name: change.current.name(),
        user: change.user,
    }))
}

/// POST /api/admin/users/{user_id}/cancel-subscription
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    ApiPath(user_id): ApiPath<Uuid>,
) -> ApiResult<Json<ApiResponse<SubscriptionCancellation>>> {
    let payments = state.billing.reconciler.payments().clone();
    let cancellation = state
        .billing
        .entitlements
        .cancel_subscriptions(user_id, payments.as_ref())
        .await?;
    tracing::info!(
        admin = %admin.email,
        user_id = %user_id,
        cancelled = cancellation.cancelled_subscriptions.len(),
        "Admin cancelled subscriptions"
    );

    Ok(ApiResponse::ok(cancellation))
}
