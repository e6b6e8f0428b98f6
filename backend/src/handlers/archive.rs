//! Cycle archive HTTP handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::middleware::CurrentUser;
use crate::services::archive::ArchiveService;
use crate::AppState;

pub async fn list_archives(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(block_id): Path<Uuid>,
) -> impl IntoResponse {
    let service = ArchiveService::new(state.db.clone());

    match service.list_archives(block_id).await {
        Ok(archives) => {
            (StatusCode::OK, Json(serde_json::json!({ "archives": archives }))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

pub async fn get_archive(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(archive_id): Path<Uuid>,
) -> impl IntoResponse {
    let service = ArchiveService::new(state.db.clone());

    match service.get_archive(archive_id).await {
        Ok(archive) => (StatusCode::OK, Json(archive)).into_response(),
        Err(e) => e.into_response(),
    }
}
