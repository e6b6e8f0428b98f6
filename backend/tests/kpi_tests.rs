//! Yield KPI property-based tests
//!
//! Covers:
//! - Efficiency is round(actual / predicted * 100, 2) and zero without a prediction
//! - Recording harvests one by one agrees with a full resum
//! - Removing a harvest never drives totals negative
//! - Performance bands
//! - Harvest totals across a planted cycle

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use shared::{
    apply_status_change, yield_efficiency, Actor, Block, BlockKpi, BlockStatus,
    PerformanceCategory, PlantGrowthCycle, StatusChangeRequest,
};
use uuid::Uuid;

// ============================================================================
// Property Test Strategies
// ============================================================================

/// Harvest weights between 0.01 and 500.00 kg
fn quantity_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..=50_000).prop_map(|hundredths| Decimal::new(hundredths, 2))
}

fn quantities_strategy() -> impl Strategy<Value = Vec<Decimal>> {
    prop::collection::vec(quantity_strategy(), 0..30)
}

fn prediction_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..=100_000).prop_map(|tenths| Decimal::new(tenths, 1))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_efficiency_formula(
        actual in quantity_strategy(),
        predicted in prediction_strategy(),
    ) {
        let efficiency = yield_efficiency(actual, predicted);
        if predicted.is_zero() {
            prop_assert_eq!(efficiency, Decimal::ZERO);
        } else {
            let expected = (actual / predicted * Decimal::ONE_HUNDRED).round_dp(2);
            prop_assert_eq!(efficiency, expected);
        }
        prop_assert!(efficiency.scale() <= 2);
    }

    /// Incremental recording and a resum over the same harvests agree
    #[test]
    fn prop_incremental_matches_resum(
        predicted in prediction_strategy(),
        quantities in quantities_strategy(),
    ) {
        let mut incremental = BlockKpi::with_prediction(predicted);
        for quantity in &quantities {
            incremental.record_harvest(*quantity);
        }

        let mut resummed = BlockKpi::with_prediction(predicted);
        resummed.resum(quantities.iter().copied());

        let total: Decimal = quantities.iter().copied().sum();
        prop_assert_eq!(&incremental, &resummed);
        prop_assert_eq!(incremental.actual_yield_kg, total);
        prop_assert_eq!(incremental.total_harvests as usize, quantities.len());
    }

    /// Removing more than was recorded floors at zero
    #[test]
    fn prop_remove_never_negative(
        recorded in quantities_strategy(),
        removed in quantities_strategy(),
    ) {
        let mut kpi = BlockKpi::with_prediction(Decimal::from(100));
        for quantity in recorded {
            kpi.record_harvest(quantity);
        }
        for quantity in removed {
            kpi.remove_harvest(quantity);
            prop_assert!(kpi.actual_yield_kg >= Decimal::ZERO);
            prop_assert!(kpi.total_harvests >= 0);
            prop_assert!(kpi.yield_efficiency_percent >= Decimal::ZERO);
        }
    }

    /// Bands are monotonic in efficiency
    #[test]
    fn prop_performance_monotonic(a in 0i64..=50_000, b in 0i64..=50_000) {
        let (low, high) = (a.min(b), a.max(b));
        let low = PerformanceCategory::from_efficiency(Decimal::new(low, 2));
        let high = PerformanceCategory::from_efficiency(Decimal::new(high, 2));
        prop_assert!(rank(high) >= rank(low));
    }
}

fn rank(category: PerformanceCategory) -> u8 {
    match category {
        PerformanceCategory::Poor => 0,
        PerformanceCategory::Acceptable => 1,
        PerformanceCategory::Good => 2,
        PerformanceCategory::Excellent => 3,
        PerformanceCategory::Exceeding => 4,
        PerformanceCategory::Exceptional => 5,
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[test]
fn test_performance_band_edges() {
    let cases = [
        ("49.99", PerformanceCategory::Poor),
        ("50", PerformanceCategory::Acceptable),
        ("70", PerformanceCategory::Good),
        ("90", PerformanceCategory::Excellent),
        ("100", PerformanceCategory::Exceeding),
        ("200", PerformanceCategory::Exceptional),
    ];
    for (efficiency, expected) in cases {
        let efficiency: Decimal = efficiency.parse().unwrap();
        assert_eq!(PerformanceCategory::from_efficiency(efficiency), expected, "{efficiency}");
    }
}

#[test]
fn test_unusual_efficiency_is_flagged_not_rejected() {
    let mut kpi = BlockKpi::with_prediction(Decimal::from(10));
    kpi.record_harvest(Decimal::from(150));
    assert_eq!(kpi.yield_efficiency_percent, Decimal::from(1500));
    assert!(kpi.is_unusual());
}

#[test]
fn test_harvests_over_a_planted_cycle() {
    let now: DateTime<Utc> = DateTime::parse_from_rfc3339("2026-03-01T06:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    let actor = Actor::new(Uuid::new_v4(), "grower@farm.test");
    let lettuce = PlantGrowthCycle {
        plant_id: Uuid::new_v4(),
        name: "Lettuce".to_string(),
        germination_days: 4,
        vegetative_days: 25,
        flowering_days: 0,
        fruiting_days: 0,
        harvest_duration_days: 7,
        expected_yield_per_plant_kg: Decimal::new(4, 1),
    };

    let mut block = Block::new_empty(
        Uuid::new_v4(),
        "F001",
        2,
        "Hydro bay".to_string(),
        200,
        None,
        &actor,
        now,
    );
    block = apply_status_change(
        &block,
        &StatusChangeRequest::planting(lettuce.plant_id, 200),
        &actor,
        Some(&lettuce),
        now,
    )
    .unwrap()
    .block;
    assert_eq!(block.kpi.predicted_yield_kg, Decimal::from(80));

    for status in [BlockStatus::Growing, BlockStatus::Fruiting, BlockStatus::Harvesting] {
        block = apply_status_change(&block, &StatusChangeRequest::to(status), &actor, None, now + Duration::days(30))
            .unwrap()
            .block;
    }

    block.kpi.record_harvest(Decimal::new(305, 1));
    block.kpi.record_harvest(Decimal::new(415, 1));
    assert_eq!(block.kpi.actual_yield_kg, Decimal::from(72));
    assert_eq!(block.kpi.total_harvests, 2);
    assert_eq!(block.kpi.yield_efficiency_percent, Decimal::from(90));
    assert_eq!(block.kpi.performance(), PerformanceCategory::Excellent);

    // Editing the first harvest from 30.5 to 20.5 resums the cycle
    block.kpi.resum([Decimal::new(205, 1), Decimal::new(415, 1)]);
    assert_eq!(block.kpi.actual_yield_kg, Decimal::from(62));
    assert_eq!(block.kpi.yield_efficiency_percent, Decimal::new(7750, 2));
    assert_eq!(block.kpi.performance(), PerformanceCategory::Good);
}
