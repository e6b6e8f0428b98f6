//! Schema discovery for the AI query engine
//!
//! Samples documents from every collection of a [`DocumentStore`] and infers
//! field types, nesting, index metadata and `_id` relationships. The result is
//! cached for `ttl` and shared by all requests.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::datastore::pipeline::normalize_extended_json;
use crate::datastore::{DocumentStore, IndexInfo, StoreError};

const MAX_SAMPLES: usize = 3;
const MAX_SAMPLE_CHARS: usize = 100;
const MAX_DEPTH: usize = 3;

/// Inferred shape of one field path
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub types: BTreeSet<String>,
    pub is_array: bool,
    pub is_nested: bool,
    pub samples: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    pub name: String,
    pub sampled_documents: usize,
    pub fields: BTreeMap<String, FieldInfo>,
    pub indexes: Vec<IndexInfo>,
}

/// A `*_id` field that points at another collection
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub from_collection: String,
    pub field: String,
    pub to_collection: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSchema {
    pub collections: BTreeMap<String, CollectionSchema>,
    pub relationships: Vec<Relationship>,
    pub discovered_at: DateTime<Utc>,
}

impl DatabaseSchema {
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    /// Compact text rendering used inside generation prompts
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for collection in self.collections.values() {
            let _ = writeln!(out, "Collection `{}`:", collection.name);
            for (path, field) in &collection.fields {
                let types = field.types.iter().cloned().collect::<Vec<_>>().join("|");
                let samples = field
                    .samples
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                if samples.is_empty() {
                    let _ = writeln!(out, "  - {}: {}", path, types);
                } else {
                    let _ = writeln!(out, "  - {}: {} (e.g. {})", path, types, samples);
                }
            }
        }
        if !self.relationships.is_empty() {
            out.push_str("Relationships:\n");
            for rel in &self.relationships {
                let _ = writeln!(
                    out,
                    "  - {}.{} -> {}",
                    rel.from_collection, rel.field, rel.to_collection
                );
            }
        }
        out
    }
}

struct CachedSchema {
    schema: Arc<DatabaseSchema>,
    discovered: Instant,
}

pub struct SchemaDiscovery {
    store: Arc<dyn DocumentStore>,
    ttl: Duration,
    sample_size: usize,
    cached: Mutex<Option<CachedSchema>>,
}

impl SchemaDiscovery {
    pub fn new(store: Arc<dyn DocumentStore>, ttl: Duration, sample_size: usize) -> Self {
        Self {
            store,
            ttl,
            sample_size,
            cached: Mutex::new(None),
        }
    }

    /// Current schema, from cache unless expired or `force_refresh` is set
    pub async fn discover(&self, force_refresh: bool) -> Result<Arc<DatabaseSchema>, StoreError> {
        let mut cached = self.cached.lock().await;

        if !force_refresh {
            if let Some(entry) = cached.as_ref() {
                if entry.discovered.elapsed() < self.ttl {
                    return Ok(entry.schema.clone());
                }
            }
        }

        let schema = Arc::new(self.scan().await?);
        tracing::info!(
            collections = schema.collections.len(),
            relationships = schema.relationships.len(),
            "Schema discovered"
        );
        *cached = Some(CachedSchema {
            schema: schema.clone(),
            discovered: Instant::now(),
        });
        Ok(schema)
    }

    pub async fn clear(&self) {
        *self.cached.lock().await = None;
    }

    async fn scan(&self) -> Result<DatabaseSchema, StoreError> {
        let names = self.store.list_collections().await?;
        let mut collections = BTreeMap::new();

        for name in &names {
            let documents = self.store.sample_documents(name, self.sample_size).await?;
            let indexes = self.store.list_indexes(name).await?;

            let mut fields = BTreeMap::new();
            for document in &documents {
                let document = normalize_extended_json(document.clone());
                if let Value::Object(map) = &document {
                    for (key, value) in map {
                        record_field(&mut fields, key, value, false, 0);
                    }
                }
            }

            collections.insert(
                name.clone(),
                CollectionSchema {
                    name: name.clone(),
                    sampled_documents: documents.len(),
                    fields,
                    indexes,
                },
            );
        }

        let relationships = find_relationships(&collections);

        Ok(DatabaseSchema {
            collections,
            relationships,
            discovered_at: Utc::now(),
        })
    }
}

fn record_field(
    fields: &mut BTreeMap<String, FieldInfo>,
    path: &str,
    value: &Value,
    nested: bool,
    depth: usize,
) {
    let info = fields.entry(path.to_string()).or_default();
    info.is_nested |= nested;
    info.types.insert(value_type(value).to_string());

    match value {
        Value::Array(items) => {
            info.is_array = true;
            for item in items.iter().take(MAX_SAMPLES) {
                if !matches!(item, Value::Object(_) | Value::Array(_)) {
                    info.types.insert(value_type(item).to_string());
                }
            }
        }
        Value::Object(map) => {
            if depth < MAX_DEPTH {
                for (key, child) in map {
                    record_field(fields, &format!("{}.{}", path, key), child, true, depth + 1);
                }
            }
        }
        Value::Null => {}
        scalar => {
            if info.samples.len() < MAX_SAMPLES {
                let sample = truncate_sample(scalar);
                if !info.samples.contains(&sample) {
                    info.samples.push(sample);
                }
            }
        }
    }
}

fn truncate_sample(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > MAX_SAMPLE_CHARS => {
            Value::String(s.chars().take(MAX_SAMPLE_CHARS).collect())
        }
        other => other.clone(),
    }
}

/// Type name reported for a JSON value
pub fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::String(s) => string_type(s),
    }
}

fn string_type(s: &str) -> &'static str {
    if s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        "ObjectId"
    } else if s.len() == 36 && Uuid::parse_str(s).is_ok() {
        "uuid"
    } else if DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
    {
        "datetime"
    } else {
        "string"
    }
}

/// Naive English plural used to match `*_id` fields to collections
pub fn pluralize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix('y') {
        format!("{}ies", stem)
    } else if word.ends_with('s') {
        word.to_string()
    } else {
        format!("{}s", word)
    }
}

fn find_relationships(collections: &BTreeMap<String, CollectionSchema>) -> Vec<Relationship> {
    let mut relationships = Vec::new();
    for collection in collections.values() {
        for (path, field) in &collection.fields {
            if field.is_nested {
                continue;
            }
            let Some(stem) = path.strip_suffix("_id") else {
                continue;
            };
            if stem.is_empty() {
                continue;
            }
            let target = pluralize(stem);
            if target != collection.name && collections.contains_key(&target) {
                relationships.push(Relationship {
                    from_collection: collection.name.clone(),
                    field: path.clone(),
                    to_collection: target,
                });
            }
        }
    }
    relationships
}
