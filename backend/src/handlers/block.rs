//! Block lifecycle HTTP handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use shared::BlockStatus;
use uuid::Uuid;

use crate::middleware::CurrentUser;
use crate::services::block::{BlockService, ChangeStatusInput, CreateBlockInput};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListBlocksQuery {
    pub status: Option<BlockStatus>,
}

/// Create a block in a farm
pub async fn create_block(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(farm_id): Path<Uuid>,
    Json(input): Json<CreateBlockInput>,
) -> impl IntoResponse {
    if let Err(e) = user.require_write() {
        return e.into_response();
    }
    let service = BlockService::new(state.db.clone());

    match service.create_block(farm_id, input, &user.actor()).await {
        Ok(block) => (StatusCode::CREATED, Json(block)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// List the blocks of a farm
pub async fn list_blocks(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(farm_id): Path<Uuid>,
    Query(query): Query<ListBlocksQuery>,
) -> impl IntoResponse {
    let service = BlockService::new(state.db.clone());

    match service.list_blocks(farm_id, query.status).await {
        Ok(blocks) => (StatusCode::OK, Json(serde_json::json!({ "blocks": blocks }))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn get_block(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(block_id): Path<Uuid>,
) -> impl IntoResponse {
    let service = BlockService::new(state.db.clone());

    match service.get_block(block_id).await {
        Ok(block) => (StatusCode::OK, Json(block)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Change a block's status
pub async fn change_status(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(block_id): Path<Uuid>,
    Json(input): Json<ChangeStatusInput>,
) -> impl IntoResponse {
    if let Err(e) = user.require_write() {
        return e.into_response();
    }
    let service = BlockService::new(state.db.clone());

    match service.change_status(block_id, input, &user.actor()).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Statuses the block may move to next
pub async fn get_transitions(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(block_id): Path<Uuid>,
) -> impl IntoResponse {
    let service = BlockService::new(state.db.clone());

    match service.get_transitions(block_id).await {
        Ok(transitions) => (StatusCode::OK, Json(transitions)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Dashboard metrics for a block
pub async fn get_metrics(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(block_id): Path<Uuid>,
) -> impl IntoResponse {
    let service = BlockService::new(state.db.clone());

    match service.get_metrics(block_id).await {
        Ok(metrics) => (StatusCode::OK, Json(metrics)).into_response(),
        Err(e) => e.into_response(),
    }
}
