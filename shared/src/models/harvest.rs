//! Block harvest models

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single harvest event recorded against a block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockHarvest {
    pub harvest_id: Uuid,
    pub block_id: Uuid,
    pub cycle_id: Uuid,
    pub quantity_kg: Decimal,
    pub quality_grade: QualityGrade,
    pub harvested_by: Uuid,
    pub harvested_by_email: String,
    pub harvested_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Produce quality grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityGrade {
    A,
    B,
    C,
}

impl QualityGrade {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityGrade::A => "A",
            QualityGrade::B => "B",
            QualityGrade::C => "C",
        }
    }
}

impl FromStr for QualityGrade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(QualityGrade::A),
            "B" => Ok(QualityGrade::B),
            "C" => Ok(QualityGrade::C),
            other => Err(format!("Unknown quality grade: {}", other)),
        }
    }
}

impl std::fmt::Display for QualityGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
