use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{pipeline, DocumentStore, IndexInfo, StoreError};

/// In-memory document store for engine tests
#[derive(Default)]
pub struct MemoryStore {
    pub collections: Mutex<HashMap<String, Vec<Value>>>,
    pub indexes: Mutex<HashMap<String, Vec<IndexInfo>>>,
    pub aggregate_calls: AtomicU64,
    pub sample_calls: AtomicU64,
}

impl MemoryStore {
    pub fn with_collection(mut self, name: &str, documents: Vec<Value>) -> Self {
        self.collections.get_mut().insert(name.to_string(), documents);
        self
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.collections.lock().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn sample_documents(&self, collection: &str, limit: usize) -> Result<Vec<Value>, StoreError> {
        self.sample_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .collections
            .lock()
            .await
            .get(collection)
            .map(|docs| docs.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, StoreError> {
        Ok(self.indexes.lock().await.get(collection).cloned().unwrap_or_default())
    }

    async fn aggregate(&self, collection: &str, stages: &[Value]) -> Result<Vec<Value>, StoreError> {
        self.aggregate_calls.fetch_add(1, Ordering::Relaxed);
        let collections = self.collections.lock().await;
        let documents = collections
            .get(collection)
            .cloned()
            .ok_or_else(|| StoreError::InvalidCollection(collection.to_string()))?;
        let foreign = pipeline::lookup_targets(stages)
            .into_iter()
            .filter_map(|name| collections.get(&name).cloned().map(|docs| (name, docs)))
            .collect();
        Ok(pipeline::execute(documents, stages, &foreign)?)
    }
}
