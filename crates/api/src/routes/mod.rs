//! API routes

mod activation;
mod admin;
mod checkout;
mod coupons;
mod quiz;
mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use axum::{
    http::HeaderMap,
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use nexo_shared::RateLimitConfig;
use serde::Serialize;

use crate::{
    auth::{require_admin, require_auth},
    error::{ApiError, ApiResult},
    extract::ClientIp,
    state::AppState,
};

/// `{success: true, data}` body of every successful response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let authenticated = Router::new()
        .route("/api/activation-codes/redeem", post(activation::redeem))
        .route_layer(middleware::from_fn_with_state(auth_state.clone(), require_auth));

    let admin = Router::new()
        .route("/api/admin/users/{user_id}/tier", put(admin::set_user_tier))
        .route(
            "/api/admin/users/{user_id}/cancel-subscription",
            post(admin::cancel_subscription),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_admin));

    let public = Router::new()
        .route("/health", get(health))
        .route("/api/activation-codes/validate", get(activation::validate))
        .route("/api/activation-codes/by-session", get(activation::by_session))
        .route("/api/checkout/session-info", get(checkout::session_info))
        .route("/api/checkout/reconcile", post(checkout::reconcile))
        .route("/api/checkout/verify", get(checkout::verify))
        .route("/api/coupons/validate", get(coupons::validate))
        .route("/api/quiz/recommend", post(quiz::recommend))
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook));

    Router::new()
        .merge(public)
        .merge(authenticated)
        .merge(admin)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<ApiResponse<HealthResponse>> {
    ApiResponse::ok(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Client IP as reported by `trusted_hops` proxies in front of the server.
///
/// Each proxy appends the address it received the request from, so the
/// client is the entry `trusted_hops` from the right. Anything left of it
/// was supplied by the client and is ignored.
pub(crate) fn forwarded_client_ip(headers: &HeaderMap, trusted_hops: usize) -> Option<String> {
    if trusted_hops == 0 {
        return None;
    }
    if let Some(xff) = headers.get("X-Forwarded-For").and_then(|h| h.to_str().ok()) {
        return xff
            .rsplit(',')
            .map(str::trim)
            .nth(trusted_hops - 1)
            .filter(|ip| !ip.is_empty())
            .map(String::from);
    }
    ["CF-Connecting-IP", "X-Real-IP"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|h| h.to_str().ok()))
        .map(|ip| ip.trim().to_string())
}

/// Count one request of `action` for the calling client.
///
/// A failing limiter backend lets the request through.
pub(crate) async fn enforce_rate_limit(
    state: &AppState,
    ClientIp(client): &ClientIp,
    action: &'static str,
    limit: RateLimitConfig,
) -> ApiResult<()> {
    match state.rate_limiter.check(client, action, limit).await {
        Ok(result) if result.allowed => Ok(()),
        Ok(result) => {
            tracing::warn!(client = %client, action, "Rate limit exceeded");
            Err(ApiError::RateLimited {
                retry_after_seconds: result.retry_after_seconds.unwrap_or(1),
            })
        }
        Err(e) => {
            tracing::error!(error = %e, action, "Rate limiter unavailable");
            Ok(())
        }
    }
}

/// Reject a missing or blank query/body parameter
pub(crate) fn require_param<'a>(value: Option<&'a str>, name: &str) -> ApiResult<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Validation(format!("{} is required", name)))
}
