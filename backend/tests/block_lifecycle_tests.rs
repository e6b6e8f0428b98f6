//! Block lifecycle property-based and unit tests
//!
//! Covers:
//! - ALERT and previous status always appear together
//! - Returning to EMPTY zeroes the KPI and leaves a single status change
//! - Disallowed transitions fail and leave the block untouched
//! - Transition lookups are idempotent
//! - A cycle is never dropped without being handed back for archiving
//! - Planting and alert resolution scenarios

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use shared::{
    apply_status_change, Actor, Block, BlockKpi, BlockStateMachine, BlockStatus,
    PlantGrowthCycle, StatusChangeRequest,
};
use uuid::Uuid;

// ============================================================================
// Fixtures
// ============================================================================

fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-02-01T07:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn actor() -> Actor {
    Actor::new(Uuid::new_v4(), "grower@farm.test")
}

fn cucumber() -> PlantGrowthCycle {
    PlantGrowthCycle {
        plant_id: Uuid::new_v4(),
        name: "Cucumber".to_string(),
        germination_days: 5,
        vegetative_days: 20,
        flowering_days: 7,
        fruiting_days: 10,
        harvest_duration_days: 21,
        expected_yield_per_plant_kg: Decimal::new(25, 1),
    }
}

fn empty_block(max_plants: i32) -> Block {
    Block::new_empty(
        Uuid::new_v4(),
        "GH01",
        1,
        "Greenhouse A".to_string(),
        max_plants,
        None,
        &actor(),
        start(),
    )
}

// ============================================================================
// Property Test Strategies
// ============================================================================

fn status_strategy() -> impl Strategy<Value = BlockStatus> {
    prop::sample::select(BlockStatus::ALL.to_vec())
}

/// A walk of requested statuses, valid or not
fn walk_strategy() -> impl Strategy<Value = Vec<BlockStatus>> {
    prop::collection::vec(status_strategy(), 1..40)
}

/// Apply `target` the way a caller would: planting always carries a crop
fn step(block: &Block, target: BlockStatus, plant: &PlantGrowthCycle, at: DateTime<Utc>) -> Option<Block> {
    let request = if target == BlockStatus::Planted {
        StatusChangeRequest::planting(plant.plant_id, 40)
    } else {
        StatusChangeRequest::to(target)
    };
    apply_status_change(block, &request, &actor(), Some(plant), at)
        .ok()
        .map(|applied| applied.block)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// ALERT <=> previous_status is set, along any walk
    #[test]
    fn prop_alert_iff_previous_status(walk in walk_strategy()) {
        let plant = cucumber();
        let mut block = empty_block(100);
        let mut at = start();

        for target in walk {
            at += Duration::days(1);
            if let Some(next) = step(&block, target, &plant, at) {
                block = next;
            }
            prop_assert_eq!(block.status == BlockStatus::Alert, block.previous_status.is_some());
            prop_assert!(block.kpi.actual_yield_kg >= Decimal::ZERO);
            prop_assert!(!block.status_changes.is_empty());
        }
    }

    /// Every successful move to EMPTY resets the cycle
    #[test]
    fn prop_empty_resets_kpi_and_history(walk in walk_strategy()) {
        let plant = cucumber();
        let mut block = empty_block(100);
        let mut at = start();

        for target in walk {
            at += Duration::days(1);
            if let Some(next) = step(&block, target, &plant, at) {
                block = next;
                if block.status == BlockStatus::Empty {
                    prop_assert_eq!(&block.kpi, &BlockKpi::default());
                    prop_assert_eq!(block.status_changes.len(), 1);
                    prop_assert!(block.cycle_id.is_none());
                    prop_assert!(block.planted_date.is_none());
                }
            }
        }
    }

    /// Whenever a cycle id goes away, the applied change returns that cycle
    #[test]
    fn prop_replaced_cycle_is_handed_back(walk in walk_strategy()) {
        let plant = cucumber();
        let mut block = empty_block(100);
        let mut at = start();

        for target in walk {
            at += Duration::days(1);
            let request = if target == BlockStatus::Planted {
                StatusChangeRequest::planting(plant.plant_id, 40)
            } else {
                StatusChangeRequest::to(target)
            };
            let Ok(applied) = apply_status_change(&block, &request, &actor(), Some(&plant), at) else {
                continue;
            };

            if block.cycle_id.is_some() && applied.block.cycle_id != block.cycle_id {
                let completed = applied.completed_cycle.as_ref().map(|c| c.cycle_id);
                prop_assert_eq!(completed, Some(block.cycle_id));
            } else {
                prop_assert!(applied.completed_cycle.is_none());
            }
            block = applied.block;
        }
    }

    /// Transitions outside the table fail and the input is unchanged
    #[test]
    fn prop_invalid_transition_leaves_block_unmodified(
        current in status_strategy(),
        target in status_strategy(),
    ) {
        prop_assume!(!BlockStateMachine::is_valid_transition(current, target));

        let mut block = empty_block(100);
        block.status = current;
        if current == BlockStatus::Alert {
            block.previous_status = Some(BlockStatus::Growing);
        }
        let before = block.clone();

        let result = apply_status_change(&block, &StatusChangeRequest::to(target), &actor(), None, start());
        let is_invalid_transition = matches!(result, Err(shared::LifecycleError::InvalidTransition { .. }));
        prop_assert!(is_invalid_transition);
        prop_assert_eq!(block, before);
    }

    /// Lookups are pure
    #[test]
    fn prop_valid_transitions_idempotent(current in status_strategy()) {
        let first = BlockStateMachine::valid_transitions(current);
        let second = BlockStateMachine::valid_transitions(current);
        prop_assert_eq!(&first, &second);
        if current == BlockStatus::Alert {
            prop_assert_eq!(first.len(), 6);
            prop_assert!(!first.contains(&BlockStatus::Alert));
        } else {
            prop_assert!(first.contains(&BlockStatus::Alert));
        }
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_empty_to_harvesting_is_rejected() {
    let block = empty_block(100);
    let err = apply_status_change(
        &block,
        &StatusChangeRequest::to(BlockStatus::Harvesting),
        &actor(),
        None,
        start(),
    )
    .unwrap_err();

    match err {
        shared::LifecycleError::InvalidTransition { current, requested, allowed } => {
            assert_eq!(current, BlockStatus::Empty);
            assert_eq!(requested, BlockStatus::Harvesting);
            assert_eq!(allowed, vec![BlockStatus::Planted, BlockStatus::Alert]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_planting_ninety_five_plants() {
    let plant = cucumber();
    let block = empty_block(100);
    let now = start() + Duration::hours(3);

    let planted = apply_status_change(
        &block,
        &StatusChangeRequest::planting(plant.plant_id, 95),
        &actor(),
        Some(&plant),
        now,
    )
    .unwrap()
    .block;

    assert_eq!(planted.status, BlockStatus::Planted);
    assert_eq!(planted.planted_date, Some(now));
    assert_eq!(planted.actual_plant_count, Some(95));
    assert_eq!(planted.kpi.predicted_yield_kg, Decimal::new(2375, 1));
    assert_eq!(planted.target_crop_name.as_deref(), Some("Cucumber"));
    assert_eq!(
        planted.expected_harvest_date,
        Some(now + Duration::days(plant.days_to_harvest()))
    );
}

#[test]
fn test_alert_resolution_restores_growing() {
    let plant = cucumber();
    let mut block = empty_block(100);
    for target in [BlockStatus::Planted, BlockStatus::Growing, BlockStatus::Alert] {
        block = step(&block, target, &plant, start()).unwrap();
    }
    assert_eq!(block.previous_status, Some(BlockStatus::Growing));

    let previous = block.previous_status.unwrap();
    let restored = apply_status_change(
        &block,
        &StatusChangeRequest::to(previous).with_notes("All alerts resolved"),
        &actor(),
        None,
        start(),
    )
    .unwrap()
    .block;

    assert_eq!(restored.status, BlockStatus::Growing);
    assert_eq!(restored.previous_status, None);
    assert_eq!(restored.cycle_id, block.cycle_id);
}

#[test]
fn test_replanting_during_harvest_alert_returns_old_cycle() {
    let plant = cucumber();
    let mut block = empty_block(100);
    for target in [
        BlockStatus::Planted,
        BlockStatus::Growing,
        BlockStatus::Fruiting,
        BlockStatus::Harvesting,
    ] {
        block = step(&block, target, &plant, start()).unwrap();
    }
    block.kpi.record_harvest(Decimal::from(30));
    let old_cycle = block.cycle_id;
    let alerted = step(&block, BlockStatus::Alert, &plant, start()).unwrap();

    let applied = apply_status_change(
        &alerted,
        &StatusChangeRequest::planting(plant.plant_id, 50),
        &actor(),
        Some(&plant),
        start() + Duration::days(1),
    )
    .unwrap();

    let completed = applied.completed_cycle.expect("old cycle for archiving");
    assert_eq!(completed.cycle_id, old_cycle);
    assert_eq!(completed.kpi.actual_yield_kg, Decimal::from(30));
    assert_ne!(applied.block.cycle_id, old_cycle);
    assert_eq!(applied.block.kpi.actual_yield_kg, Decimal::ZERO);
}
