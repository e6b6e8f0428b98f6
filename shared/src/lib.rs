//! Shared types and models for the Farm Operations Platform
//!
//! This crate contains the pure domain logic shared between the backend, the
//! browser (via WASM) and tests: the block lifecycle state machine, KPI
//! accumulation, dashboard metrics, and the AI query security gate.

pub mod archive;
pub mod error;
pub mod kpi;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod query_validation;
pub mod report_parser;
pub mod types;
pub mod validation;

pub use archive::*;
pub use error::*;
pub use kpi::*;
pub use lifecycle::*;
pub use metrics::*;
pub use models::*;
pub use query_validation::*;
pub use report_parser::*;
pub use types::*;
pub use validation::*;
