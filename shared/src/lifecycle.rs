//! Block lifecycle state machine
//!
//! ```text
//! EMPTY -> PLANTED -> GROWING -> FRUITING -> HARVESTING -> CLEANING -> EMPTY
//! ```
//!
//! Any status may be interrupted by ALERT, which remembers the interrupted
//! status in `previous_status`. Leaving ALERT clears it again.
//!
//! Everything here is pure: [`apply_status_change`] takes the current block and
//! returns the next one, leaving the input untouched on failure.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::LifecycleError;
use crate::kpi::BlockKpi;
use crate::models::{Block, BlockStatus, OffsetType, PlantGrowthCycle, StatusChange};
use crate::types::Actor;

/// Transition table for the block lifecycle
pub struct BlockStateMachine;

impl BlockStateMachine {
    /// Statuses reachable from `current`.
    ///
    /// ALERT is present in every non-alert row; from ALERT every other status
    /// is reachable (restore).
    pub fn valid_transitions(current: BlockStatus) -> Vec<BlockStatus> {
        match current {
            BlockStatus::Empty => vec![BlockStatus::Planted, BlockStatus::Alert],
            BlockStatus::Planted => vec![BlockStatus::Growing, BlockStatus::Alert],
            BlockStatus::Growing => vec![BlockStatus::Fruiting, BlockStatus::Alert],
            BlockStatus::Fruiting => vec![BlockStatus::Harvesting, BlockStatus::Alert],
            BlockStatus::Harvesting => vec![BlockStatus::Cleaning, BlockStatus::Alert],
            BlockStatus::Cleaning => vec![BlockStatus::Empty, BlockStatus::Alert],
            BlockStatus::Alert => BlockStatus::ALL
                .into_iter()
                .filter(|s| *s != BlockStatus::Alert)
                .collect(),
        }
    }

    pub fn is_valid_transition(current: BlockStatus, target: BlockStatus) -> bool {
        Self::valid_transitions(current).contains(&target)
    }

    pub fn validate_transition(
        current: BlockStatus,
        target: BlockStatus,
    ) -> Result<(), LifecycleError> {
        if Self::is_valid_transition(current, target) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                current,
                requested: target,
                allowed: Self::valid_transitions(current),
            })
        }
    }
}

/// A requested status change
#[derive(Debug, Clone)]
pub struct StatusChangeRequest {
    pub new_status: BlockStatus,
    pub notes: Option<String>,
    pub target_crop: Option<Uuid>,
    pub actual_plant_count: Option<i32>,
}

impl StatusChangeRequest {
    pub fn to(new_status: BlockStatus) -> Self {
        Self {
            new_status,
            notes: None,
            target_crop: None,
            actual_plant_count: None,
        }
    }

    pub fn planting(target_crop: Uuid, actual_plant_count: i32) -> Self {
        Self {
            new_status: BlockStatus::Planted,
            notes: None,
            target_crop: Some(target_crop),
            actual_plant_count: Some(actual_plant_count),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Result of applying a status change
#[derive(Debug, Clone)]
pub struct AppliedTransition {
    /// The block as it must be persisted
    pub block: Block,
    /// Snapshot of the cycle that just finished: present when the block
    /// returned to EMPTY from a planted cycle, or was re-planted from ALERT
    /// over one. Must be archived together with persisting `block`.
    pub completed_cycle: Option<Block>,
}

/// Apply `request` to `block`.
///
/// `plant` is the growth cycle of the requested crop and is only consulted
/// when planting.
pub fn apply_status_change(
    block: &Block,
    request: &StatusChangeRequest,
    actor: &Actor,
    plant: Option<&PlantGrowthCycle>,
    now: DateTime<Utc>,
) -> Result<AppliedTransition, LifecycleError> {
    let new_status = request.new_status;
    BlockStateMachine::validate_transition(block.status, new_status)?;

    let mut next = block.clone();
    next.updated_at = now;

    if new_status == BlockStatus::Alert {
        next.previous_status = Some(block.status);
    } else if block.status == BlockStatus::Alert {
        next.previous_status = None;
    }

    // Leaving ALERT for the interrupted status resumes the cycle as it was.
    let resuming = block.status == BlockStatus::Alert && block.previous_status == Some(new_status);

    // Planting from ALERT over a live cycle replaces it; the old cycle is
    // handed back for archiving like a return to EMPTY.
    let mut replaced_cycle = None;
    if new_status == BlockStatus::Planted && !resuming {
        plant_block(&mut next, request, plant, now)?;
        if block.cycle_id.is_some() {
            replaced_cycle = Some(block.clone());
            next.status_changes.clear();
        }
    }

    let change = status_change_record(&next, request, actor, now);
    next.status = new_status;

    if new_status == BlockStatus::Empty {
        let completed_cycle = block.cycle_id.map(|_| {
            let mut snapshot = block.clone();
            snapshot.status_changes.push(change.clone());
            snapshot
        });
        reset_cycle(&mut next, change);
        return Ok(AppliedTransition {
            block: next,
            completed_cycle,
        });
    }

    next.status_changes.push(change);
    Ok(AppliedTransition {
        block: next,
        completed_cycle: replaced_cycle,
    })
}

/// Expected date for every status of a cycle planted at `planted`
pub fn expected_status_changes(
    planted: DateTime<Utc>,
    plant: &PlantGrowthCycle,
) -> BTreeMap<BlockStatus, DateTime<Utc>> {
    let growing = planted + Duration::days(plant.germination_days);
    let fruiting = growing + Duration::days(plant.vegetative_days + plant.flowering_days);
    let harvesting = fruiting + Duration::days(plant.fruiting_days);
    let cleaning = harvesting + Duration::days(plant.harvest_duration_days);

    BTreeMap::from([
        (BlockStatus::Planted, planted),
        (BlockStatus::Growing, growing),
        (BlockStatus::Fruiting, fruiting),
        (BlockStatus::Harvesting, harvesting),
        (BlockStatus::Cleaning, cleaning),
    ])
}

/// Signed whole-day difference between when a change happened and when it
/// was expected. Positive means late.
pub fn offset_days(actual: DateTime<Utc>, expected: DateTime<Utc>) -> i64 {
    (actual.date_naive() - expected.date_naive()).num_days()
}

fn plant_block(
    block: &mut Block,
    request: &StatusChangeRequest,
    plant: Option<&PlantGrowthCycle>,
    now: DateTime<Utc>,
) -> Result<(), LifecycleError> {
    let target_crop = request
        .target_crop
        .ok_or_else(|| LifecycleError::validation("target_crop", "Planting requires a target crop"))?;
    let plant_count = request.actual_plant_count.ok_or_else(|| {
        LifecycleError::validation("actual_plant_count", "Planting requires an actual plant count")
    })?;

    if plant_count <= 0 {
        return Err(LifecycleError::validation(
            "actual_plant_count",
            "Actual plant count must be greater than 0",
        ));
    }
    if block.max_plants > 0 && plant_count > block.max_plants {
        return Err(LifecycleError::validation(
            "actual_plant_count",
            format!(
                "Actual plant count {} exceeds block capacity of {}",
                plant_count, block.max_plants
            ),
        ));
    }

    block.cycle_id = Some(Uuid::new_v4());
    block.target_crop = Some(target_crop);
    block.actual_plant_count = Some(plant_count);
    block.planted_date = Some(now);

    match plant {
        Some(plant) => {
            let expected = expected_status_changes(now, plant);
            block.target_crop_name = Some(plant.name.clone());
            block.expected_harvest_date = expected.get(&BlockStatus::Harvesting).copied();
            block.expected_status_changes = expected;
            block.kpi = BlockKpi::with_prediction(
                plant.expected_yield_per_plant_kg * Decimal::from(plant_count),
            );
        }
        None => {
            block.target_crop_name = None;
            block.expected_harvest_date = None;
            block.expected_status_changes.clear();
            block.kpi = BlockKpi::default();
        }
    }

    Ok(())
}

fn status_change_record(
    block: &Block,
    request: &StatusChangeRequest,
    actor: &Actor,
    now: DateTime<Utc>,
) -> StatusChange {
    let expected_date = block
        .expected_status_changes
        .get(&request.new_status)
        .copied();
    let offset = expected_date.map(|expected| offset_days(now, expected));

    StatusChange {
        status: request.new_status,
        changed_at: now,
        changed_by: actor.user_id,
        changed_by_email: actor.email.clone(),
        notes: request.notes.clone(),
        expected_date,
        offset_days: offset,
        offset_type: offset.map(OffsetType::classify),
    }
}

fn reset_cycle(block: &mut Block, change: StatusChange) {
    block.previous_status = None;
    block.cycle_id = None;
    block.target_crop = None;
    block.target_crop_name = None;
    block.actual_plant_count = None;
    block.planted_date = None;
    block.expected_harvest_date = None;
    block.expected_status_changes.clear();
    block.kpi = BlockKpi::default();
    block.status_changes = vec![change];
}
