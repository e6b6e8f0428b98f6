//! WebAssembly module for the Farm Operations Platform
//!
//! Provides client-side computation for:
//! - Block lifecycle transitions
//! - Yield efficiency and performance bands
//! - Dashboard metrics
//! - Pre-validation of AI query pipelines before they are submitted

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use wasm_bindgen::prelude::*;

// Re-export shared types for use in JavaScript
pub use shared::models::*;
pub use shared::types::*;
pub use shared::validation::*;

use shared::{
    calculate_dashboard_metrics, yield_efficiency, BlockStateMachine, PerformanceCategory,
    QueryLimits, QueryValidator,
};

/// Statuses reachable from `status`, as a JSON array
#[wasm_bindgen]
pub fn valid_transitions(status: &str) -> Result<String, JsValue> {
    transitions_json(status).map_err(|e| JsValue::from_str(&e))
}

/// Whether `current -> target` is allowed
#[wasm_bindgen]
pub fn is_valid_transition(current: &str, target: &str) -> bool {
    match (current.parse::<BlockStatus>(), target.parse::<BlockStatus>()) {
        (Ok(current), Ok(target)) => BlockStateMachine::is_valid_transition(current, target),
        _ => false,
    }
}

/// Yield efficiency percentage, rounded to two decimals
#[wasm_bindgen]
pub fn calculate_yield_efficiency(actual_yield_kg: f64, predicted_yield_kg: f64) -> f64 {
    let actual = Decimal::try_from(actual_yield_kg).unwrap_or(Decimal::ZERO);
    let predicted = Decimal::try_from(predicted_yield_kg).unwrap_or(Decimal::ZERO);
    yield_efficiency(actual, predicted).to_f64().unwrap_or(0.0)
}

/// Performance band for an efficiency percentage
#[wasm_bindgen]
pub fn classify_performance(efficiency_percent: f64) -> String {
    let efficiency = Decimal::try_from(efficiency_percent).unwrap_or(Decimal::ZERO);
    PerformanceCategory::from_efficiency(efficiency).to_string()
}

/// Dashboard metrics for a block, evaluated at the browser's current time
#[wasm_bindgen]
pub fn calculate_block_metrics(block_json: &str, plant_json: Option<String>) -> Result<String, JsValue> {
    let now = DateTime::<Utc>::from_timestamp_millis(js_sys::Date::now() as i64)
        .ok_or_else(|| JsValue::from_str("Invalid clock"))?;
    metrics_json(block_json, plant_json.as_deref(), now).map_err(|e| JsValue::from_str(&e))
}

/// Check a pipeline before submitting it. Returns the pipeline that would be
/// executed, with the default `$limit` appended when missing.
#[wasm_bindgen]
pub fn prevalidate_pipeline(
    collection: &str,
    pipeline_json: &str,
    collections_json: &str,
    role: &str,
) -> Result<String, JsValue> {
    prevalidate_json(collection, pipeline_json, collections_json, role)
        .map_err(|e| JsValue::from_str(&e))
}

fn transitions_json(status: &str) -> Result<String, String> {
    let status: BlockStatus = status.parse()?;
    serde_json::to_string(&BlockStateMachine::valid_transitions(status)).map_err(|e| e.to_string())
}

fn metrics_json(block_json: &str, plant_json: Option<&str>, now: DateTime<Utc>) -> Result<String, String> {
    let block: Block =
        serde_json::from_str(block_json).map_err(|e| format!("Invalid block JSON: {}", e))?;
    let plant: Option<PlantGrowthCycle> = plant_json
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| format!("Invalid plant JSON: {}", e))?;

    let metrics = calculate_dashboard_metrics(&block, plant.as_ref(), now);
    serde_json::to_string(&metrics).map_err(|e| e.to_string())
}

fn prevalidate_json(
    collection: &str,
    pipeline_json: &str,
    collections_json: &str,
    role: &str,
) -> Result<String, String> {
    let pipeline: Vec<Value> =
        serde_json::from_str(pipeline_json).map_err(|e| format!("Invalid pipeline JSON: {}", e))?;
    let collections: Vec<String> = serde_json::from_str(collections_json)
        .map_err(|e| format!("Invalid collections JSON: {}", e))?;
    let role: UserRole = serde_json::from_value(Value::String(role.to_string()))
        .map_err(|_| format!("Unknown role '{}'", role))?;

    let validator = QueryValidator::new(collections, QueryLimits::default());
    let validated = validator
        .validate(collection, &pipeline, role)
        .map_err(|e| e.to_string())?;
    serde_json::to_string(&validated.pipeline).map_err(|e| e.to_string())
}
