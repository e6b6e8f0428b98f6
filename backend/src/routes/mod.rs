//! Route definitions for the Farm Operations Platform

use axum::{
    middleware,
    routing::{delete, get, patch, post, put},
    Router,
};

use crate::{handlers, middleware::auth_middleware, AppState};

/// Create API routes
pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Health check (public)
        .route("/health", get(handlers::health_check))
        // Protected routes
        .merge(protected_routes(state))
}

fn protected_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .nest("/farms", farm_routes())
        .nest("/blocks", block_routes())
        .nest("/harvests", harvest_routes())
        .nest("/alerts", alert_routes())
        .nest("/archives", archive_routes())
        .nest("/plants", plant_routes())
        .nest("/ai", ai_routes())
        .route_layer(middleware::from_fn_with_state(state, auth_middleware))
}

/// Farm-scoped block routes
fn farm_routes() -> Router<AppState> {
    Router::new().route(
        "/:farm_id/blocks",
        get(handlers::list_blocks).post(handlers::create_block),
    )
}

/// Block lifecycle routes
fn block_routes() -> Router<AppState> {
    Router::new()
        .route("/:block_id", get(handlers::get_block))
        .route("/:block_id/status", patch(handlers::change_status))
        .route("/:block_id/transitions", get(handlers::get_transitions))
        .route("/:block_id/metrics", get(handlers::get_metrics))
        .route(
            "/:block_id/harvests",
            get(handlers::list_harvests).post(handlers::record_harvest),
        )
        .route(
            "/:block_id/alerts",
            get(handlers::list_alerts).post(handlers::create_alert),
        )
        .route("/:block_id/archives", get(handlers::list_archives))
}

fn harvest_routes() -> Router<AppState> {
    Router::new().route(
        "/:harvest_id",
        put(handlers::update_harvest).delete(handlers::delete_harvest),
    )
}

fn alert_routes() -> Router<AppState> {
    Router::new().route("/:alert_id/resolve", post(handlers::resolve_alert))
}

fn archive_routes() -> Router<AppState> {
    Router::new().route("/:archive_id", get(handlers::get_archive))
}

/// Growth-cycle reference data
fn plant_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::list_plants))
        .route("/:plant_id", get(handlers::get_plant))
}

/// AI query engine routes
fn ai_routes() -> Router<AppState> {
    Router::new()
        .route("/query", post(handlers::execute_query))
        .route("/schema", get(handlers::get_schema))
        .route("/cache", delete(handlers::clear_cache))
}
