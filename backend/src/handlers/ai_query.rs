//! AI query HTTP handlers

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use shared::ChatMessage;
use validator::Validate;

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::AppState;

/// Body of `POST /ai/query`
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AiQueryRequest {
    #[validate(length(min = 1, message = "Prompt cannot be empty"))]
    pub prompt: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Deserialize)]
pub struct SchemaQuery {
    #[serde(default)]
    pub refresh: bool,
}

/// Answer a natural-language question about farm data
pub async fn execute_query(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(input): Json<AiQueryRequest>,
) -> impl IntoResponse {
    if let Err(e) = input.validate() {
        return AppError::from(e).into_response();
    }
    if let Err(message) = shared::validate_prompt(&input.prompt) {
        return AppError::validation("prompt", message).into_response();
    }

    match state
        .query_engine
        .execute_ai_query(input.prompt.trim(), &user, &input.history, input.force_refresh)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => AppError::from(e).into_response(),
    }
}

/// The discovered schema the engine generates queries against
pub async fn get_schema(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(query): Query<SchemaQuery>,
) -> impl IntoResponse {
    match state.query_engine.schema(query.refresh).await {
        Ok(schema) => (StatusCode::OK, Json(schema.as_ref().clone())).into_response(),
        Err(e) => AppError::from(e).into_response(),
    }
}

/// Clear cached responses: admins clear everything, others only their own
pub async fn clear_cache(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> impl IntoResponse {
    let engine = &state.query_engine;

    let cleared = if user.role.is_admin() {
        let entries = engine.cache_stats().entries;
        engine.close().await;
        entries
    } else {
        engine.invalidate_user(user.user_id)
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "cleared": cleared,
            "stats": engine.cache_stats(),
        })),
    )
        .into_response()
}
