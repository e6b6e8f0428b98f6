//! Farm Operations Platform - Backend Server
//!
//! Block lifecycle management (status machine, harvest KPIs, alerts and cycle
//! archives) and a natural-language query engine over farm data.

use axum::{routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod datastore;
mod error;
mod external;
mod handlers;
mod middleware;
mod routes;
mod services;

pub use config::Config;

use datastore::PgDocumentStore;
use external::GeminiClient;
use services::{QueryEngine, QueryEngineConfig};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub config: Arc<Config>,
    pub query_engine: Arc<QueryEngine>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "farmops_server=debug,tower_http=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::load()?;

    tracing::info!("Starting Farm Operations Server");
    tracing::info!("Environment: {}", config.environment);

    // Create database connection pool
    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.database.url)
        .await?;

    tracing::info!("Database connection established");

    // Run migrations in development
    if config.environment == "development" {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&db_pool).await?;
        tracing::info!("Migrations completed");
    }

    if config.ai.api_key.is_empty() {
        tracing::warn!("No generative API key configured; AI queries will fail");
    }

    // AI query engine
    let store = Arc::new(PgDocumentStore::new(
        db_pool.clone(),
        config.query_limits.scan_limit,
    ));
    let generator = Arc::new(GeminiClient::new(&config.ai)?);
    let query_engine = Arc::new(QueryEngine::new(
        store,
        generator,
        QueryEngineConfig::from_config(&config.ai, &config.query_limits),
    ));

    // Create application state
    let state = AppState {
        db: db_pool,
        config: Arc::new(config.clone()),
        query_engine: query_engine.clone(),
    };

    // Build application
    let app = create_app(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    query_engine.close().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Create the application router with all routes and middleware
fn create_app(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .nest("/api/v1", routes::api_routes(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Root endpoint
async fn root() -> &'static str {
    "Farm Operations Platform API v1.0"
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiConfig, DatabaseConfig, JwtConfig, QueryLimitsConfig, ServerConfig};
    use crate::datastore::memory::MemoryStore;
    use crate::external::{GenerationError, GenerationOutput, TextGenerator};
    use crate::middleware::auth::Claims;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::{json, Value};
    use shared::UserRole;
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "test-secret";

    /// Always answers with the same text
    struct FixedGenerator(&'static str);

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        async fn generate(&self, _prompt: &str, _max: u32) -> Result<GenerationOutput, GenerationError> {
            Ok(GenerationOutput {
                text: self.0.to_string(),
                ..GenerationOutput::default()
            })
        }
    }

    fn test_config() -> Config {
        Config {
            environment: "test".into(),
            server: ServerConfig {
                port: 0,
                host: "127.0.0.1".into(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/farmops_test".into(),
                max_connections: 1,
                min_connections: 0,
            },
            jwt: JwtConfig {
                secret: SECRET.into(),
            },
            ai: AiConfig {
                endpoint: "http://localhost".into(),
                api_key: String::new(),
                model: "test".into(),
                request_timeout_secs: 1,
                cache_ttl_secs: 60,
                schema_ttl_secs: 60,
                schema_sample_size: 10,
                history_messages: 3,
                report_attempts: 1,
                report_backoff_ms: 0,
                report_sample_rows: 10,
                input_token_price: 0.0,
                output_token_price: 0.0,
            },
            query_limits: QueryLimitsConfig {
                max_stages: 20,
                max_lookups: 3,
                max_groups: 5,
                max_limit: 1000,
                scan_limit: 100,
                restricted_collections: vec!["users".into()],
            },
        }
    }

    fn app(generated: &'static str) -> Router {
        let config = test_config();
        let db = PgPoolOptions::new()
            .connect_lazy(&config.database.url)
            .unwrap();
        let store = Arc::new(
            MemoryStore::default()
                .with_collection("blocks", vec![json!({"block_code": "F001-001", "status": "growing"})]),
        );
        let engine = QueryEngine::new(
            store,
            Arc::new(FixedGenerator(generated)),
            QueryEngineConfig::from_config(&config.ai, &config.query_limits),
        );
        create_app(AppState {
            db,
            config: Arc::new(config),
            query_engine: Arc::new(engine),
        })
    }

    fn bearer(role: UserRole) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            email: "grower@farm.test".into(),
            role,
            exp: now + 3600,
            iat: now,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();
        format!("Bearer {}", token)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_root_is_public() {
        let response = app("{}")
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_route_requires_token() {
        let uri = format!("/api/v1/blocks/{}", Uuid::new_v4());
        let response = app("{}")
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_viewer_cannot_change_status() {
        let uri = format!("/api/v1/blocks/{}/status", Uuid::new_v4());
        let response = app("{}")
            .oneshot(
                Request::builder()
                    .method(Method::PATCH)
                    .uri(uri)
                    .header(header::AUTHORIZATION, bearer(UserRole::Viewer))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"status": "growing"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_ai_query_rejects_forbidden_operator() {
        let generated = r#"{"collection": "blocks", "query": [{"$match": {"$where": "1"}}], "explanation": ""}"#;
        let response = app(generated)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/ai/query")
                    .header(header::AUTHORIZATION, bearer(UserRole::User))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"prompt": "which blocks are growing"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "QUERY_REJECTED");
        assert_eq!(body["error"]["details"]["operator"], "$where");
    }

    #[tokio::test]
    async fn test_ai_query_rejects_empty_prompt() {
        let response = app("{}")
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/ai/query")
                    .header(header::AUTHORIZATION, bearer(UserRole::User))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"prompt": "   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["field"], "prompt");
    }

    #[tokio::test]
    async fn test_schema_and_cache_routes() {
        let app = app("{}");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/ai/schema")
                    .header(header::AUTHORIZATION, bearer(UserRole::User))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["collections"]["blocks"]["fields"]["status"].is_object());

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/api/v1/ai/cache")
                    .header(header::AUTHORIZATION, bearer(UserRole::Admin))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["cleared"], 0);
    }
}
