//! Configuration management for the Farm Operations Platform
//!
//! Supports hierarchical configuration loading:
//! 1. Default values in code
//! 2. Configuration files (development.toml, production.toml)
//! 3. Environment variable overrides with FARMOPS_ prefix

use config::{ConfigError, Environment, File};
use serde::Deserialize;
use shared::QueryLimits;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Current environment (development, production)
    pub environment: String,

    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// JWT verification configuration
    pub jwt: JwtConfig,

    /// Generative backend and AI query engine configuration
    pub ai: AiConfig,

    /// Caps applied to generated aggregation pipelines
    pub query_limits: QueryLimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server port
    pub port: u16,

    /// Server host
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JwtConfig {
    /// Secret key used to verify HS256 access tokens
    pub secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    /// Base URL of the generative API
    pub endpoint: String,

    /// API key; an empty key disables the AI routes' backend calls
    #[serde(default)]
    pub api_key: String,

    /// Model name used for both query and report generation
    pub model: String,

    /// HTTP timeout for generative calls in seconds
    pub request_timeout_secs: u64,

    /// Query result cache lifetime in seconds
    pub cache_ttl_secs: u64,

    /// Schema cache lifetime in seconds
    pub schema_ttl_secs: u64,

    /// Documents sampled per collection during schema discovery
    pub schema_sample_size: usize,

    /// Prior conversation messages included in the generation prompt
    pub history_messages: usize,

    /// Report generation attempts before JSON repair
    pub report_attempts: u32,

    /// Initial backoff between report attempts in milliseconds
    pub report_backoff_ms: u64,

    /// Result rows included in the report prompt
    pub report_sample_rows: usize,

    /// USD per million prompt tokens
    pub input_token_price: f64,

    /// USD per million completion tokens
    pub output_token_price: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryLimitsConfig {
    pub max_stages: usize,
    pub max_lookups: usize,
    pub max_groups: usize,
    pub max_limit: u64,

    /// Rows loaded per collection when executing a pipeline
    pub scan_limit: i64,

    pub restricted_collections: Vec<String>,
}

impl QueryLimitsConfig {
    pub fn to_limits(&self) -> QueryLimits {
        QueryLimits {
            max_stages: self.max_stages,
            max_lookups: self.max_lookups,
            max_groups: self.max_groups,
            max_limit: self.max_limit,
            restricted_collections: self.restricted_collections.clone(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("FARMOPS_ENVIRONMENT").unwrap_or_else(|_| "development".into());
        let limits = QueryLimits::default();

        let config = config::Config::builder()
            // Start with default values
            .set_default("environment", environment.clone())?
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("ai.endpoint", "https://generativelanguage.googleapis.com/v1beta")?
            .set_default("ai.model", "gemini-1.5-flash")?
            .set_default("ai.request_timeout_secs", 60)?
            .set_default("ai.cache_ttl_secs", 30 * 60)?
            .set_default("ai.schema_ttl_secs", 24 * 60 * 60)?
            .set_default("ai.schema_sample_size", 100)?
            .set_default("ai.history_messages", 3)?
            .set_default("ai.report_attempts", 3)?
            .set_default("ai.report_backoff_ms", 500)?
            .set_default("ai.report_sample_rows", 50)?
            .set_default("ai.input_token_price", 0.075)?
            .set_default("ai.output_token_price", 0.30)?
            .set_default("query_limits.max_stages", limits.max_stages as i64)?
            .set_default("query_limits.max_lookups", limits.max_lookups as i64)?
            .set_default("query_limits.max_groups", limits.max_groups as i64)?
            .set_default("query_limits.max_limit", limits.max_limit as i64)?
            .set_default("query_limits.scan_limit", 10_000)?
            .set_default("query_limits.restricted_collections", limits.restricted_collections)?
            // Load environment-specific config file
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Override with environment variables (FARMOPS_ prefix)
            .add_source(
                Environment::with_prefix("FARMOPS")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("query_limits.restricted_collections")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
