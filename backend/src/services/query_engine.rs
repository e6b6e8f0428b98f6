//! AI query engine
//!
//! Turns a natural-language prompt into an aggregation pipeline using the
//! generative backend, validates it, runs it against the document store and
//! asks the backend for a narrative report of the results.
//!
//! ```text
//! prompt -> cache? -> schema -> generate -> validate -> execute -> report -> cache
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use shared::{
    looks_truncated, parse_json_lenient, parse_report, AnalysisReport, ChatMessage, QueryLimits,
    QueryValidationError, QueryValidator, RepairStrategy,
};
use thiserror::Error;
use uuid::Uuid;

use super::query_cache::{cache_key, CacheStats, QueryCache};
use super::schema_discovery::{DatabaseSchema, SchemaDiscovery};
use crate::config::{AiConfig, QueryLimitsConfig};
use crate::datastore::pipeline::normalize_extended_json;
use crate::datastore::DocumentStore;
use crate::external::{GenerationOutput, TextGenerator};
use crate::middleware::AuthUser;

const QUERY_MAX_OUTPUT_TOKENS: u32 = 2048;
const REPORT_MAX_OUTPUT_TOKENS: u32 = 8192;

/// Every way an AI query can fail
#[derive(Debug, Error)]
pub enum QueryExecutionError {
    #[error("Generated query rejected: {0}")]
    Validation(#[from] QueryValidationError),

    #[error("Schema discovery failed: {0}")]
    Schema(String),

    #[error("Query generation failed: {0}")]
    Generation(String),

    #[error("Query execution failed: {0}")]
    Execution(String),
}

impl QueryExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryExecutionError::Validation(_) => "validation",
            QueryExecutionError::Schema(_) => "schema",
            QueryExecutionError::Generation(_) => "generation",
            QueryExecutionError::Execution(_) => "execution",
        }
    }
}

/// Tunables for the engine
#[derive(Debug, Clone)]
pub struct QueryEngineConfig {
    pub cache_ttl: Duration,
    pub schema_ttl: Duration,
    pub schema_sample_size: usize,
    pub history_messages: usize,
    pub report_attempts: u32,
    pub report_backoff: Duration,
    pub report_sample_rows: usize,
    /// USD per million prompt tokens
    pub input_token_price: f64,
    /// USD per million completion tokens
    pub output_token_price: f64,
    pub limits: QueryLimits,
}

impl QueryEngineConfig {
    pub fn from_config(ai: &AiConfig, limits: &QueryLimitsConfig) -> Self {
        Self {
            cache_ttl: Duration::from_secs(ai.cache_ttl_secs),
            schema_ttl: Duration::from_secs(ai.schema_ttl_secs),
            schema_sample_size: ai.schema_sample_size,
            history_messages: ai.history_messages,
            report_attempts: ai.report_attempts.max(1),
            report_backoff: Duration::from_millis(ai.report_backoff_ms),
            report_sample_rows: ai.report_sample_rows,
            input_token_price: ai.input_token_price,
            output_token_price: ai.output_token_price,
            limits: limits.to_limits(),
        }
    }
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30 * 60),
            schema_ttl: Duration::from_secs(24 * 60 * 60),
            schema_sample_size: 100,
            history_messages: 3,
            report_attempts: 3,
            report_backoff: Duration::from_millis(500),
            report_sample_rows: 50,
            input_token_price: 0.075,
            output_token_price: 0.30,
            limits: QueryLimits::default(),
        }
    }
}

/// The pipeline that was actually executed
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedQuery {
    pub collection: String,
    pub pipeline: Vec<Value>,
    pub explanation: String,
    pub limit_injected: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    fn add(&mut self, output: &GenerationOutput) {
        self.prompt_tokens += output.prompt_tokens;
        self.completion_tokens += output.completion_tokens;
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
    }
}

/// Milliseconds spent in each phase
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueryTimings {
    pub schema_ms: u64,
    pub generation_ms: u64,
    pub execution_ms: u64,
    pub report_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiQueryResponse {
    pub query: ExecutedQuery,
    pub results: Vec<Value>,
    pub result_count: usize,
    pub report: AnalysisReport,
    pub report_strategy: RepairStrategy,
    pub token_usage: TokenUsage,
    pub estimated_cost_usd: f64,
    pub timings: QueryTimings,
    pub cached: bool,
    pub generated_at: DateTime<Utc>,
}

pub struct QueryEngine {
    store: Arc<dyn DocumentStore>,
    generator: Arc<dyn TextGenerator>,
    schema: SchemaDiscovery,
    cache: QueryCache<AiQueryResponse>,
    config: QueryEngineConfig,
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        generator: Arc<dyn TextGenerator>,
        config: QueryEngineConfig,
    ) -> Self {
        let schema = SchemaDiscovery::new(store.clone(), config.schema_ttl, config.schema_sample_size);
        Self {
            store,
            generator,
            schema,
            cache: QueryCache::new(config.cache_ttl),
            config,
        }
    }

    /// Answer `prompt` for `user`.
    ///
    /// `force_refresh` bypasses the response cache and rediscovers the schema.
    pub async fn execute_ai_query(
        &self,
        prompt: &str,
        user: &AuthUser,
        history: &[ChatMessage],
        force_refresh: bool,
    ) -> Result<AiQueryResponse, QueryExecutionError> {
        let started = Instant::now();
        let key = cache_key(user.user_id, prompt);

        if !force_refresh {
            if let Some(mut cached) = self.cache.get(&key) {
                tracing::debug!(user_id = %user.user_id, "AI query served from cache");
                cached.cached = true;
                return Ok(cached);
            }
        }

        let mut timings = QueryTimings::default();
        let mut usage = TokenUsage::default();

        // Schema
        let phase = Instant::now();
        let schema = self.schema(force_refresh).await?;
        timings.schema_ms = elapsed_ms(phase);

        // Generation
        let phase = Instant::now();
        let query_prompt = build_query_prompt(
            prompt,
            &schema,
            history,
            self.config.history_messages,
            self.config.limits.max_limit,
        );
        let output = self
            .generator
            .generate(&query_prompt, QUERY_MAX_OUTPUT_TOKENS)
            .await
            .map_err(|e| QueryExecutionError::Generation(e.to_string()))?;
        usage.add(&output);
        let generated = parse_generated_query(&output.text)?;
        timings.generation_ms = elapsed_ms(phase);

        // Validation
        let validator = QueryValidator::new(schema.collection_names(), self.config.limits.clone());
        let validated = validator
            .validate(&generated.collection, &generated.pipeline, user.role)
            .map_err(|err| {
                tracing::warn!(
                    user_id = %user.user_id,
                    operator = err.operator.as_deref().unwrap_or("-"),
                    stage = ?err.stage,
                    "Generated query rejected"
                );
                QueryExecutionError::Validation(err)
            })?;

        // Execution
        let phase = Instant::now();
        let results: Vec<Value> = self
            .store
            .aggregate(&validated.collection, &validated.pipeline)
            .await
            .map_err(|e| QueryExecutionError::Execution(e.to_string()))?
            .into_iter()
            .map(normalize_extended_json)
            .collect();
        timings.execution_ms = elapsed_ms(phase);

        let query = ExecutedQuery {
            collection: validated.collection,
            pipeline: validated.pipeline,
            explanation: generated.explanation,
            limit_injected: validated.limit_injected,
        };

        // Report
        let phase = Instant::now();
        let report_prompt = build_report_prompt(prompt, &query, &results, self.config.report_sample_rows);
        let raw_report = self.generate_report(&report_prompt, &mut usage).await;
        let parsed = parse_report(&raw_report);
        if parsed.strategy == RepairStrategy::Fallback {
            tracing::warn!(user_id = %user.user_id, "Report output unparseable; using fallback report");
        }
        timings.report_ms = elapsed_ms(phase);
        timings.total_ms = elapsed_ms(started);

        let response = AiQueryResponse {
            result_count: results.len(),
            query,
            results,
            report: parsed.report,
            report_strategy: parsed.strategy,
            token_usage: usage,
            estimated_cost_usd: estimate_cost(
                &usage,
                self.config.input_token_price,
                self.config.output_token_price,
            ),
            timings,
            cached: false,
            generated_at: Utc::now(),
        };

        tracing::info!(
            user_id = %user.user_id,
            collection = %response.query.collection,
            results = response.result_count,
            total_ms = timings.total_ms,
            "AI query executed"
        );

        self.cache.insert(key, user.user_id, response.clone());
        Ok(response)
    }

    /// Current schema, for `GET /ai/schema`
    pub async fn schema(&self, force_refresh: bool) -> Result<Arc<DatabaseSchema>, QueryExecutionError> {
        self.schema
            .discover(force_refresh)
            .await
            .map_err(|e| QueryExecutionError::Schema(e.to_string()))
    }

    /// Ask for a report, retrying with exponential backoff while the output
    /// is empty or cut off. Returns the last text received.
    async fn generate_report(&self, prompt: &str, usage: &mut TokenUsage) -> String {
        let mut backoff = self.config.report_backoff;
        let mut last_text = String::new();

        for attempt in 1..=self.config.report_attempts {
            match self.generator.generate(prompt, REPORT_MAX_OUTPUT_TOKENS).await {
                Ok(output) => {
                    usage.add(&output);
                    let incomplete = output.text.trim().is_empty()
                        || output.truncated
                        || looks_truncated(&output.text);
                    if !output.text.trim().is_empty() {
                        last_text = output.text;
                    }
                    if !incomplete {
                        return last_text;
                    }
                    tracing::warn!(attempt, "Report output empty or truncated");
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "Report generation failed");
                }
            }

            if attempt < self.config.report_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        last_text
    }

    /// Drop cached responses of one user
    pub fn invalidate_user(&self, user_id: Uuid) -> usize {
        self.cache.invalidate_user(user_id)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Release cached state; the engine stays usable and starts cold
    pub async fn close(&self) {
        self.cache.clear();
        self.schema.clear().await;
        tracing::info!("AI query engine caches cleared");
    }
}

/// The `{collection, query, explanation}` object produced by the backend
#[derive(Debug, Clone, PartialEq)]
struct GeneratedQuery {
    collection: String,
    pipeline: Vec<Value>,
    explanation: String,
}

fn parse_generated_query(raw: &str) -> Result<GeneratedQuery, QueryExecutionError> {
    let (value, _) = parse_json_lenient(raw).ok_or_else(|| {
        QueryExecutionError::Generation("Backend did not return a JSON query".to_string())
    })?;

    let collection = value
        .get("collection")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| QueryExecutionError::Generation("Generated query has no collection".to_string()))?
        .to_string();

    let pipeline = match value.get("query").or_else(|| value.get("pipeline")) {
        Some(Value::Array(stages)) => stages.clone(),
        Some(Value::Object(stage)) => vec![Value::Object(stage.clone())],
        _ => {
            return Err(QueryExecutionError::Generation(
                "Generated query has no pipeline".to_string(),
            ))
        }
    };

    let explanation = value
        .get("explanation")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(GeneratedQuery {
        collection,
        pipeline,
        explanation,
    })
}

fn build_query_prompt(
    prompt: &str,
    schema: &DatabaseSchema,
    history: &[ChatMessage],
    history_messages: usize,
    max_limit: u64,
) -> String {
    let mut out = String::from(
        "You translate questions about farm operations into a MongoDB-style aggregation pipeline.\n\
         Respond with a single JSON object: {\"collection\": string, \"query\": [stages], \"explanation\": string}.\n\
         Use only read stages. Never use $where, $function, $accumulator, $expr, $out or $merge.\n",
    );
    out.push_str(&format!("Return at most {} documents.\n\n", max_limit));
    out.push_str("Database schema:\n");
    out.push_str(&schema.describe());

    let recent = &history[history.len().saturating_sub(history_messages)..];
    if !recent.is_empty() {
        out.push_str("\nConversation so far:\n");
        for message in recent {
            out.push_str(&format!("{}: {}\n", message.role, message.content));
        }
    }

    out.push_str(&format!("\nQuestion: {}\n", prompt));
    out
}

fn build_report_prompt(prompt: &str, query: &ExecutedQuery, results: &[Value], sample_rows: usize) -> String {
    let sample: Vec<&Value> = results.iter().take(sample_rows).collect();
    let sample_json = serde_json::to_string(&sample).unwrap_or_else(|_| "[]".to_string());

    format!(
        "Analyse the result of a farm operations query.\n\
         Respond with a single JSON object with keys \"summary\" (string), \"insights\" (array of strings), \
         \"statistics\" (object), \"visualization_suggestions\" (array of objects) and \"markdown\" (string).\n\n\
         Question: {}\n\
         Collection: {}\n\
         Explanation: {}\n\
         Result count: {}\n\
         Results (first {}): {}\n",
        prompt,
        query.collection,
        query.explanation,
        results.len(),
        sample.len(),
        sample_json
    )
}

fn estimate_cost(usage: &TokenUsage, input_price: f64, output_price: f64) -> f64 {
    (usage.prompt_tokens as f64 * input_price + usage.completion_tokens as f64 * output_price)
        / 1_000_000.0
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
