//! Farm models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A farm owning cultivation blocks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Farm {
    pub farm_id: Uuid,
    pub farm_code: String,
    pub name: String,
    /// Last block sequence handed out; incremented atomically in the store
    pub next_block_sequence: i32,
    pub created_at: DateTime<Utc>,
}
