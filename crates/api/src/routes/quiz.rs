//! Plan recommendation quiz

use std::collections::HashMap;

use axum::{extract::State, Json};
use nexo_billing::load_quiz_config;
use serde::{Deserialize, Serialize};

use super::ApiResponse;
use crate::{error::ApiResult, extract::ApiJson, state::AppState};

#[derive(Debug, Deserialize)]
pub struct RecommendRequest {
    /// Question id to option id
    answers: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendResponse {
    tier: u8,
    tier_name: &'static str,
    score: u32,
}

/// POST /api/quiz/recommend
pub async fn recommend(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RecommendRequest>,
) -> ApiResult<Json<ApiResponse<RecommendResponse>>> {
    let quiz = load_quiz_config(state.config_store.as_ref()).await;
    let recommendation = quiz.recommend(&req.answers)?;

    Ok(ApiResponse::ok(RecommendResponse {
        tier: recommendation.tier.level(),
        tier_name: recommendation.tier.name(),
        score: recommendation.score,
    }))
}
