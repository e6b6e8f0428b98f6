//! Building the archive record of a completed cultivation cycle
//!
//! The archive is assembled from the pre-reset block snapshot produced by
//! [`crate::lifecycle::apply_status_change`] together with the cycle's
//! harvests and alerts. Persistence happens in the same database transaction
//! as the block reset.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::kpi::{yield_efficiency, PerformanceCategory};
use crate::lifecycle::offset_days;
use crate::models::{
    Alert, AlertStatus, AlertSummary, ArchiveStatus, Block, BlockArchive, BlockHarvest,
    BlockStatus, DailyHarvest, StatusChange,
};
use crate::types::Actor;

/// Build the archive for `completed`, or `None` when the block never started
/// a planted cycle.
///
/// Harvests of other cycles are ignored. Alerts are kept when they were
/// raised on this block after planting.
pub fn archive_completed_cycle(
    completed: &Block,
    harvests: &[BlockHarvest],
    alerts: &[Alert],
    archived_by: &Actor,
    now: DateTime<Utc>,
) -> Option<BlockArchive> {
    let cycle_id = completed.cycle_id?;

    let mut cycle_harvests: Vec<&BlockHarvest> = harvests
        .iter()
        .filter(|h| h.cycle_id == cycle_id && h.block_id == completed.block_id)
        .collect();
    cycle_harvests.sort_by_key(|h| h.harvested_at);

    let cycle_alerts: Vec<Alert> = alerts
        .iter()
        .filter(|a| a.block_id == completed.block_id)
        .filter(|a| match completed.planted_date {
            Some(planted) => a.triggered_at >= planted,
            None => true,
        })
        .cloned()
        .collect();

    let planted_change = last_change(&completed.status_changes, BlockStatus::Planted);

    let actual_harvest_start = first_change(&completed.status_changes, BlockStatus::Harvesting)
        .map(|c| c.changed_at)
        .or_else(|| cycle_harvests.first().map(|h| h.harvested_at));
    let actual_harvest_end = first_change(&completed.status_changes, BlockStatus::Cleaning)
        .map(|c| c.changed_at)
        .or_else(|| cycle_harvests.last().map(|h| h.harvested_at));

    let harvest_delay_days = match (actual_harvest_start, completed.expected_harvest_date) {
        (Some(actual), Some(expected)) => Some(offset_days(actual, expected)),
        _ => None,
    };
    let cycle_duration_days = completed
        .planted_date
        .map(|planted| (now.date_naive() - planted.date_naive()).num_days());

    let kpi = &completed.kpi;
    let efficiency = yield_efficiency(kpi.actual_yield_kg, kpi.predicted_yield_kg);

    Some(BlockArchive {
        archive_id: Uuid::new_v4(),
        block_id: completed.block_id,
        farm_id: completed.farm_id,
        block_code: completed.block_code.clone(),
        block_name: completed.name.clone(),
        cycle_id,
        target_crop: completed.target_crop,
        target_crop_name: completed.target_crop_name.clone(),
        actual_plant_count: completed.actual_plant_count,
        max_plants: completed.max_plants,
        planted_by: planted_change.map(|c| c.changed_by),
        planted_by_email: planted_change.map(|c| c.changed_by_email.clone()),
        planted_date: completed.planted_date,
        expected_harvest_date: completed.expected_harvest_date,
        actual_harvest_start,
        actual_harvest_end,
        status_changes: completed.status_changes.clone(),
        predicted_yield_kg: kpi.predicted_yield_kg,
        actual_yield_kg: kpi.actual_yield_kg,
        yield_efficiency_percent: efficiency,
        performance_category: PerformanceCategory::from_efficiency(efficiency),
        total_harvests: kpi.total_harvests,
        daily_harvests: daily_rollups(&cycle_harvests),
        alert_summary: summarize_alerts(&cycle_alerts),
        alerts: cycle_alerts,
        harvest_delay_days,
        cycle_duration_days,
        archived_by: archived_by.user_id,
        archived_by_email: archived_by.email.clone(),
        archived_at: now,
        status: ArchiveStatus::Completed,
        completed_at: now,
    })
}

fn first_change(changes: &[StatusChange], status: BlockStatus) -> Option<&StatusChange> {
    changes.iter().find(|c| c.status == status)
}

fn last_change(changes: &[StatusChange], status: BlockStatus) -> Option<&StatusChange> {
    changes.iter().rev().find(|c| c.status == status)
}

fn daily_rollups(harvests: &[&BlockHarvest]) -> Vec<DailyHarvest> {
    let mut days: BTreeMap<NaiveDate, DailyHarvest> = BTreeMap::new();

    for harvest in harvests {
        let date = harvest.harvested_at.date_naive();
        let day = days.entry(date).or_insert_with(|| DailyHarvest {
            date,
            total_kg: Decimal::ZERO,
            harvest_count: 0,
            quality_breakdown: BTreeMap::new(),
        });
        day.total_kg += harvest.quantity_kg;
        day.harvest_count += 1;
        *day
            .quality_breakdown
            .entry(harvest.quality_grade)
            .or_insert(Decimal::ZERO) += harvest.quantity_kg;
    }

    days.into_values().collect()
}

fn summarize_alerts(alerts: &[Alert]) -> AlertSummary {
    let mut summary = AlertSummary::default();
    for alert in alerts {
        summary.total += 1;
        if alert.status == AlertStatus::Resolved {
            summary.resolved += 1;
        }
        *summary.by_severity.entry(alert.severity).or_insert(0) += 1;
    }
    summary
}
