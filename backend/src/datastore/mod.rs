//! Document-store seam used by the AI query engine
//!
//! The engine sees collections of JSON documents. In production those are
//! PostgreSQL tables read through `to_jsonb`; tests use an in-memory store.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub mod pipeline;
pub mod postgres;

#[cfg(test)]
pub mod memory;

pub use postgres::PgDocumentStore;

/// Errors raised by a document store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] pipeline::PipelineError),
}

/// Index metadata reported by schema discovery
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Names of all queryable collections
    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    /// Up to `limit` documents from `collection`
    async fn sample_documents(&self, collection: &str, limit: usize) -> Result<Vec<Value>, StoreError>;

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, StoreError>;

    /// Run an already-validated pipeline against `collection`
    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Value>, StoreError>;
}
