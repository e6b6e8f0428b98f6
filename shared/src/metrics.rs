//! Derived block metrics for dashboards
//!
//! Pure derivations over a [`Block`]; nothing here is persisted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kpi::PerformanceCategory;
use crate::models::{Block, BlockStatus, PlantGrowthCycle};

/// Order in which a planted block is expected to progress
pub const PROGRESSION: [BlockStatus; 5] = [
    BlockStatus::Planted,
    BlockStatus::Growing,
    BlockStatus::Fruiting,
    BlockStatus::Harvesting,
    BlockStatus::Cleaning,
];

/// Yield progress while harvesting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YieldStatus {
    Ahead,
    OnTrack,
    Behind,
}

impl YieldStatus {
    pub fn from_progress(progress_percent: Decimal) -> Self {
        if progress_percent >= Decimal::ONE_HUNDRED {
            YieldStatus::Ahead
        } else if progress_percent < Decimal::from(70) {
            YieldStatus::Behind
        } else {
            YieldStatus::OnTrack
        }
    }
}

/// Recommended next operator action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    PlantCrop,
    MonitorGermination,
    MonitorGrowth,
    PrepareHarvest,
    RecordHarvest,
    CompleteCleaning,
    ResolveAlert,
}

impl NextAction {
    pub fn for_status(status: BlockStatus) -> Self {
        match status {
            BlockStatus::Empty => NextAction::PlantCrop,
            BlockStatus::Planted => NextAction::MonitorGermination,
            BlockStatus::Growing => NextAction::MonitorGrowth,
            BlockStatus::Fruiting => NextAction::PrepareHarvest,
            BlockStatus::Harvesting => NextAction::RecordHarvest,
            BlockStatus::Cleaning => NextAction::CompleteCleaning,
            BlockStatus::Alert => NextAction::ResolveAlert,
        }
    }
}

/// Dashboard view of a single block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDashboardMetrics {
    pub block_id: Uuid,
    pub status: BlockStatus,
    pub days_in_current_state: i64,
    pub next_status: Option<BlockStatus>,
    pub next_expected_date: Option<DateTime<Utc>>,
    pub days_until_next: Option<i64>,
    pub is_delayed: bool,
    /// Days late when delayed; otherwise negative days ahead
    pub delay_days: i64,
    pub capacity_percent: Decimal,
    pub yield_progress_percent: Option<Decimal>,
    pub yield_status: Option<YieldStatus>,
    pub estimated_final_yield_kg: Option<Decimal>,
    pub yield_efficiency_percent: Decimal,
    pub performance_category: PerformanceCategory,
    pub next_action: NextAction,
}

/// Compute dashboard metrics for `block` as of `now`
pub fn calculate_dashboard_metrics(
    block: &Block,
    plant: Option<&PlantGrowthCycle>,
    now: DateTime<Utc>,
) -> BlockDashboardMetrics {
    let days_in_current_state = block
        .last_status_change()
        .map(|change| (now - change.changed_at).num_days())
        .unwrap_or(0);

    let next_status = PROGRESSION
        .iter()
        .position(|s| *s == block.status)
        .and_then(|index| PROGRESSION.get(index + 1))
        .copied();
    let next_expected_date =
        next_status.and_then(|status| block.expected_status_changes.get(&status).copied());
    let days_until_next =
        next_expected_date.map(|expected| (expected.date_naive() - now.date_naive()).num_days());

    let (is_delayed, delay_days) = match days_until_next {
        Some(days) if days < 0 => (true, days.abs()),
        Some(days) => (false, -days),
        None => (false, 0),
    };

    let mut metrics = BlockDashboardMetrics {
        block_id: block.block_id,
        status: block.status,
        days_in_current_state,
        next_status,
        next_expected_date,
        days_until_next,
        is_delayed,
        delay_days,
        capacity_percent: capacity_percent(block.actual_plant_count, block.max_plants),
        yield_progress_percent: None,
        yield_status: None,
        estimated_final_yield_kg: None,
        yield_efficiency_percent: block.kpi.yield_efficiency_percent,
        performance_category: block.kpi.performance(),
        next_action: NextAction::for_status(block.status),
    };

    if block.status == BlockStatus::Harvesting {
        let kpi = &block.kpi;
        if kpi.predicted_yield_kg > Decimal::ZERO {
            let progress =
                (kpi.actual_yield_kg / kpi.predicted_yield_kg * Decimal::ONE_HUNDRED).round_dp(2);
            metrics.yield_progress_percent = Some(progress);
            metrics.yield_status = Some(YieldStatus::from_progress(progress));
        }
        metrics.estimated_final_yield_kg = Some(estimate_final_yield(block, plant, now));
    }

    metrics
}

/// `actual_plant_count / max_plants * 100`, zero when either is missing
pub fn capacity_percent(actual_plant_count: Option<i32>, max_plants: i32) -> Decimal {
    match actual_plant_count {
        Some(count) if count > 0 && max_plants > 0 => {
            (Decimal::from(count) / Decimal::from(max_plants) * Decimal::ONE_HUNDRED).round_dp(2)
        }
        _ => Decimal::ZERO,
    }
}

/// Extrapolate the final yield from the harvest rate so far
fn estimate_final_yield(block: &Block, plant: Option<&PlantGrowthCycle>, now: DateTime<Utc>) -> Decimal {
    let kpi = &block.kpi;
    if kpi.total_harvests == 0 {
        return kpi.predicted_yield_kg;
    }

    let harvest_started = block
        .status_changes
        .iter()
        .rev()
        .find(|change| change.status == BlockStatus::Harvesting)
        .map(|change| change.changed_at)
        .or(block.expected_harvest_date);

    let harvest_duration_days = plant.map(|p| p.harvest_duration_days).or_else(|| {
        let start = block.expected_status_changes.get(&BlockStatus::Harvesting)?;
        let end = block.expected_status_changes.get(&BlockStatus::Cleaning)?;
        Some((*end - *start).num_days())
    });

    match (harvest_started, harvest_duration_days) {
        (Some(started), Some(duration)) if duration > 0 => {
            let days_harvesting = (now - started).num_days().max(1);
            (kpi.actual_yield_kg / Decimal::from(days_harvesting) * Decimal::from(duration))
                .round_dp(2)
        }
        _ => kpi.predicted_yield_kg,
    }
}
