//! PostgreSQL-backed document store
//!
//! Every public table is a collection; each row is read as a JSON document
//! with `to_jsonb`. Pipelines run in process over at most `scan_limit` rows
//! per collection.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use shared::is_valid_collection_name;
use sqlx::PgPool;

use super::{pipeline, DocumentStore, IndexInfo, StoreError};

#[derive(Clone)]
pub struct PgDocumentStore {
    db: PgPool,
    scan_limit: i64,
}

impl PgDocumentStore {
    pub fn new(db: PgPool, scan_limit: i64) -> Self {
        Self { db, scan_limit }
    }

    async fn load(&self, collection: &str, limit: i64) -> Result<Vec<Value>, StoreError> {
        if !is_valid_collection_name(collection) {
            return Err(StoreError::InvalidCollection(collection.to_string()));
        }
        // Identifier is restricted to [A-Za-z0-9_] above, so quoting is enough.
        let sql = format!("SELECT to_jsonb(t) FROM \"{}\" t LIMIT $1", collection);
        let rows = sqlx::query_scalar::<_, Value>(&sql)
            .bind(limit)
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT table_name::TEXT
            FROM information_schema.tables
            WHERE table_schema = 'public'
              AND table_type = 'BASE TABLE'
              AND table_name NOT LIKE '\_sqlx%'
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(names
            .into_iter()
            .filter(|name| is_valid_collection_name(name))
            .collect())
    }

    async fn sample_documents(&self, collection: &str, limit: usize) -> Result<Vec<Value>, StoreError> {
        self.load(collection, limit as i64).await
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT indexname::TEXT, indexdef
            FROM pg_indexes
            WHERE schemaname = 'public' AND tablename = $1
            ORDER BY indexname
            "#,
        )
        .bind(collection)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, definition)| parse_index_definition(name, &definition))
            .collect())
    }

    async fn aggregate(&self, collection: &str, stages: &[Value]) -> Result<Vec<Value>, StoreError> {
        let documents = self.load(collection, self.scan_limit).await?;

        let mut foreign = HashMap::new();
        for target in pipeline::lookup_targets(stages) {
            let docs = self.load(&target, self.scan_limit).await?;
            foreign.insert(target, docs);
        }

        Ok(pipeline::execute(documents, stages, &foreign)?)
    }
}

/// Read the column list and uniqueness out of a `pg_indexes.indexdef`
fn parse_index_definition(name: String, definition: &str) -> IndexInfo {
    let fields = match (definition.rfind('('), definition.rfind(')')) {
        (Some(open), Some(close)) if open < close => definition[open + 1..close]
            .split(',')
            .map(|field| field.trim().trim_matches('"').to_string())
            .filter(|field| !field.is_empty())
            .collect(),
        _ => Vec::new(),
    };

    IndexInfo {
        name,
        fields,
        unique: definition.starts_with("CREATE UNIQUE INDEX"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_index_definition() {
        let info = parse_index_definition(
            "blocks_farm_id_sequence_number_key".into(),
            "CREATE UNIQUE INDEX blocks_farm_id_sequence_number_key ON public.blocks USING btree (farm_id, sequence_number)",
        );
        assert_eq!(info.fields, vec!["farm_id", "sequence_number"]);
        assert!(info.unique);

        let info = parse_index_definition(
            "idx_block_harvests_cycle".into(),
            "CREATE INDEX idx_block_harvests_cycle ON public.block_harvests USING btree (\"cycle_id\")",
        );
        assert_eq!(info.fields, vec!["cycle_id"]);
        assert!(!info.unique);
    }
}
