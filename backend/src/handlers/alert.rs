//! Block alert HTTP handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use shared::AlertStatus;
use uuid::Uuid;

use crate::middleware::CurrentUser;
use crate::services::alert::{AlertService, CreateAlertInput, ResolveAlertInput};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListAlertsQuery {
    pub status: Option<AlertStatus>,
}

/// Raise an alert on a block
pub async fn create_alert(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(block_id): Path<Uuid>,
    Json(input): Json<CreateAlertInput>,
) -> impl IntoResponse {
    if let Err(e) = user.require_write() {
        return e.into_response();
    }
    let service = AlertService::new(state.db.clone());

    match service.create_alert(block_id, input, &user.actor()).await {
        Ok(result) => (StatusCode::CREATED, Json(result)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn list_alerts(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(block_id): Path<Uuid>,
    Query(query): Query<ListAlertsQuery>,
) -> impl IntoResponse {
    let service = AlertService::new(state.db.clone());

    match service.list_alerts(block_id, query.status).await {
        Ok(alerts) => (StatusCode::OK, Json(serde_json::json!({ "alerts": alerts }))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Resolve an alert
pub async fn resolve_alert(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(alert_id): Path<Uuid>,
    Json(input): Json<ResolveAlertInput>,
) -> impl IntoResponse {
    if let Err(e) = user.require_write() {
        return e.into_response();
    }
    let service = AlertService::new(state.db.clone());

    match service.resolve_alert(alert_id, input, &user.actor()).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => e.into_response(),
    }
}
