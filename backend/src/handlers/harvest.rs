//! Harvest HTTP handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::middleware::CurrentUser;
use crate::services::harvest::{HarvestService, RecordHarvestInput, UpdateHarvestInput};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListHarvestsQuery {
    pub cycle_id: Option<Uuid>,
}

/// Record a harvest for a block
pub async fn record_harvest(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(block_id): Path<Uuid>,
    Json(input): Json<RecordHarvestInput>,
) -> impl IntoResponse {
    if let Err(e) = user.require_write() {
        return e.into_response();
    }
    let service = HarvestService::new(state.db.clone());

    match service.record_harvest(block_id, input, &user.actor()).await {
        Ok(result) => (StatusCode::CREATED, Json(result)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn list_harvests(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(block_id): Path<Uuid>,
    Query(query): Query<ListHarvestsQuery>,
) -> impl IntoResponse {
    let service = HarvestService::new(state.db.clone());

    match service.list_harvests(block_id, query.cycle_id).await {
        Ok(harvests) => {
            (StatusCode::OK, Json(serde_json::json!({ "harvests": harvests }))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Correct a harvest
pub async fn update_harvest(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(harvest_id): Path<Uuid>,
    Json(input): Json<UpdateHarvestInput>,
) -> impl IntoResponse {
    if let Err(e) = user.require_write() {
        return e.into_response();
    }
    let service = HarvestService::new(state.db.clone());

    match service.update_harvest(harvest_id, input).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_harvest(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(harvest_id): Path<Uuid>,
) -> impl IntoResponse {
    if let Err(e) = user.require_write() {
        return e.into_response();
    }
    let service = HarvestService::new(state.db.clone());

    match service.delete_harvest(harvest_id).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => e.into_response(),
    }
}
