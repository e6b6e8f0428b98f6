//! Plant growth-cycle lookup handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::middleware::CurrentUser;
use crate::services::plant_data::PlantDataService;
use crate::AppState;

pub async fn list_plants(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
) -> impl IntoResponse {
    let service = PlantDataService::new(state.db.clone());

    match service.list().await {
        Ok(plants) => (StatusCode::OK, Json(serde_json::json!({ "plants": plants }))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn get_plant(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(plant_id): Path<Uuid>,
) -> impl IntoResponse {
    let service = PlantDataService::new(state.db.clone());

    match service.get(plant_id).await {
        Ok(plant) => (StatusCode::OK, Json(plant)).into_response(),
        Err(e) => e.into_response(),
    }
}
