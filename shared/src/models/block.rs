//! Cultivation block models

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kpi::BlockKpi;

/// Lifecycle status of a cultivation block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Empty,
    Planted,
    Growing,
    Fruiting,
    Harvesting,
    Cleaning,
    Alert,
}

impl BlockStatus {
    pub const ALL: [BlockStatus; 7] = [
        BlockStatus::Empty,
        BlockStatus::Planted,
        BlockStatus::Growing,
        BlockStatus::Fruiting,
        BlockStatus::Harvesting,
        BlockStatus::Cleaning,
        BlockStatus::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Empty => "empty",
            BlockStatus::Planted => "planted",
            BlockStatus::Growing => "growing",
            BlockStatus::Fruiting => "fruiting",
            BlockStatus::Harvesting => "harvesting",
            BlockStatus::Cleaning => "cleaning",
            BlockStatus::Alert => "alert",
        }
    }
}

impl FromStr for BlockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "empty" => Ok(BlockStatus::Empty),
            "planted" => Ok(BlockStatus::Planted),
            "growing" => Ok(BlockStatus::Growing),
            "fruiting" => Ok(BlockStatus::Fruiting),
            "harvesting" => Ok(BlockStatus::Harvesting),
            "cleaning" => Ok(BlockStatus::Cleaning),
            "alert" => Ok(BlockStatus::Alert),
            other => Err(format!("Unknown block status: {}", other)),
        }
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a status change happened before, on, or after its expected date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetType {
    Early,
    OnTime,
    Late,
}

impl OffsetType {
    pub fn classify(offset_days: i64) -> Self {
        match offset_days {
            d if d < 0 => OffsetType::Early,
            0 => OffsetType::OnTime,
            _ => OffsetType::Late,
        }
    }
}

/// One entry of a block's audit trail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub status: BlockStatus,
    pub changed_at: DateTime<Utc>,
    pub changed_by: Uuid,
    pub changed_by_email: String,
    pub notes: Option<String>,
    pub expected_date: Option<DateTime<Utc>>,
    pub offset_days: Option<i64>,
    pub offset_type: Option<OffsetType>,
}

/// A cultivation block within a farm
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub block_id: Uuid,
    pub farm_id: Uuid,
    pub farm_code: String,
    pub block_code: String,
    pub sequence_number: i32,
    pub name: String,
    pub max_plants: i32,
    pub area: Option<Decimal>,

    pub status: BlockStatus,
    pub previous_status: Option<BlockStatus>,
    pub cycle_id: Option<Uuid>,
    pub target_crop: Option<Uuid>,
    pub target_crop_name: Option<String>,
    pub actual_plant_count: Option<i32>,
    pub planted_date: Option<DateTime<Utc>>,
    pub expected_harvest_date: Option<DateTime<Utc>>,
    pub expected_status_changes: BTreeMap<BlockStatus, DateTime<Utc>>,

    pub kpi: BlockKpi,
    pub status_changes: Vec<StatusChange>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Block {
    /// Build a freshly created EMPTY block with its immutable identity
    pub fn new_empty(
        farm_id: Uuid,
        farm_code: &str,
        sequence_number: i32,
        name: String,
        max_plants: i32,
        area: Option<Decimal>,
        created_by: &crate::types::Actor,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            block_id: Uuid::new_v4(),
            farm_id,
            farm_code: farm_code.to_string(),
            block_code: block_code(farm_code, sequence_number),
            sequence_number,
            name,
            max_plants,
            area,
            status: BlockStatus::Empty,
            previous_status: None,
            cycle_id: None,
            target_crop: None,
            target_crop_name: None,
            actual_plant_count: None,
            planted_date: None,
            expected_harvest_date: None,
            expected_status_changes: BTreeMap::new(),
            kpi: BlockKpi::default(),
            status_changes: vec![StatusChange {
                status: BlockStatus::Empty,
                changed_at: now,
                changed_by: created_by.user_id,
                changed_by_email: created_by.email.clone(),
                notes: Some("Block created".to_string()),
                expected_date: None,
                offset_days: None,
                offset_type: None,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    /// The most recent audit trail entry
    pub fn last_status_change(&self) -> Option<&StatusChange> {
        self.status_changes.last()
    }

    /// The status that governs harvesting and metrics, looking through an alert
    pub fn effective_status(&self) -> BlockStatus {
        match (self.status, self.previous_status) {
            (BlockStatus::Alert, Some(previous)) => previous,
            (status, _) => status,
        }
    }
}

/// Human-readable block code: `{farmCode}-{sequence:03}`
pub fn block_code(farm_code: &str, sequence_number: i32) -> String {
    format!("{}-{:03}", farm_code, sequence_number)
}
