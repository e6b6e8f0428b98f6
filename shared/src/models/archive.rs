//! Completed-cycle archive models

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Alert, AlertSeverity, QualityGrade, StatusChange};
use crate::kpi::PerformanceCategory;

/// Immutable snapshot of one finished planting cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockArchive {
    pub archive_id: Uuid,
    pub block_id: Uuid,
    pub farm_id: Uuid,
    pub block_code: String,
    pub block_name: String,
    pub cycle_id: Uuid,

    pub target_crop: Option<Uuid>,
    pub target_crop_name: Option<String>,
    pub actual_plant_count: Option<i32>,
    pub max_plants: i32,
    pub planted_by: Option<Uuid>,
    pub planted_by_email: Option<String>,
    pub planted_date: Option<DateTime<Utc>>,

    pub expected_harvest_date: Option<DateTime<Utc>>,
    pub actual_harvest_start: Option<DateTime<Utc>>,
    pub actual_harvest_end: Option<DateTime<Utc>>,
    pub status_changes: Vec<StatusChange>,

    pub predicted_yield_kg: Decimal,
    pub actual_yield_kg: Decimal,
    pub yield_efficiency_percent: Decimal,
    pub performance_category: PerformanceCategory,
    pub total_harvests: i32,
    pub daily_harvests: Vec<DailyHarvest>,

    pub alert_summary: AlertSummary,
    pub alerts: Vec<Alert>,

    /// Positive when harvesting started later than expected
    pub harvest_delay_days: Option<i64>,
    pub cycle_duration_days: Option<i64>,

    pub archived_by: Uuid,
    pub archived_by_email: String,
    pub archived_at: DateTime<Utc>,
    pub status: ArchiveStatus,
    pub completed_at: DateTime<Utc>,
}

/// Harvest totals for a single calendar day
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyHarvest {
    pub date: NaiveDate,
    pub total_kg: Decimal,
    pub harvest_count: i32,
    pub quality_breakdown: BTreeMap<QualityGrade, Decimal>,
}

/// Alerts raised during a cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AlertSummary {
    pub total: i32,
    pub resolved: i32,
    pub by_severity: BTreeMap<AlertSeverity, i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Completed,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveStatus::Completed => "completed",
        }
    }
}
