//! Block yield KPI accumulation
//!
//! Yield quantities are kept as [`Decimal`] so repeated record/remove cycles
//! never drift the way binary floating point does.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Efficiency above this percentage is accepted but flagged as unusual
pub const UNUSUAL_EFFICIENCY_PERCENT: u32 = 1000;

/// Yield KPI for a block's current cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockKpi {
    pub predicted_yield_kg: Decimal,
    pub actual_yield_kg: Decimal,
    pub yield_efficiency_percent: Decimal,
    pub total_harvests: i32,
}

impl BlockKpi {
    /// KPI for a freshly planted cycle
    pub fn with_prediction(predicted_yield_kg: Decimal) -> Self {
        Self {
            predicted_yield_kg: predicted_yield_kg.max(Decimal::ZERO),
            ..Self::default()
        }
    }

    /// Add one harvest to the running totals
    pub fn record_harvest(&mut self, quantity_kg: Decimal) {
        self.actual_yield_kg += quantity_kg;
        self.total_harvests += 1;
        self.recompute_efficiency();
    }

    /// Replace the actual yield with a full resum of the cycle's harvest
    /// quantities. Used after a harvest is edited.
    pub fn resum<I>(&mut self, quantities: I)
    where
        I: IntoIterator<Item = Decimal>,
    {
        let mut total = Decimal::ZERO;
        let mut count = 0;
        for quantity in quantities {
            total += quantity;
            count += 1;
        }
        self.actual_yield_kg = total.max(Decimal::ZERO);
        self.total_harvests = count;
        self.recompute_efficiency();
    }

    /// Take a deleted harvest out of the running totals, never going negative
    pub fn remove_harvest(&mut self, quantity_kg: Decimal) {
        self.actual_yield_kg = (self.actual_yield_kg - quantity_kg).max(Decimal::ZERO);
        self.total_harvests = (self.total_harvests - 1).max(0);
        self.recompute_efficiency();
    }

    pub fn recompute_efficiency(&mut self) {
        self.yield_efficiency_percent =
            yield_efficiency(self.actual_yield_kg, self.predicted_yield_kg);
    }

    /// True when efficiency is beyond the documented sane range
    pub fn is_unusual(&self) -> bool {
        self.yield_efficiency_percent > Decimal::from(UNUSUAL_EFFICIENCY_PERCENT)
    }

    pub fn performance(&self) -> PerformanceCategory {
        PerformanceCategory::from_efficiency(self.yield_efficiency_percent)
    }
}

/// `round(actual / predicted * 100, 2)`, or zero without a prediction
pub fn yield_efficiency(actual_yield_kg: Decimal, predicted_yield_kg: Decimal) -> Decimal {
    if predicted_yield_kg <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let efficiency = (actual_yield_kg / predicted_yield_kg) * Decimal::ONE_HUNDRED;
    efficiency.round_dp(2).max(Decimal::ZERO)
}

/// Yield performance band derived from efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceCategory {
    Exceptional,
    Exceeding,
    Excellent,
    Good,
    Acceptable,
    Poor,
}

impl PerformanceCategory {
    pub fn from_efficiency(efficiency_percent: Decimal) -> Self {
        if efficiency_percent >= Decimal::from(200) {
            PerformanceCategory::Exceptional
        } else if efficiency_percent >= Decimal::from(100) {
            PerformanceCategory::Exceeding
        } else if efficiency_percent >= Decimal::from(90) {
            PerformanceCategory::Excellent
        } else if efficiency_percent >= Decimal::from(70) {
            PerformanceCategory::Good
        } else if efficiency_percent >= Decimal::from(50) {
            PerformanceCategory::Acceptable
        } else {
            PerformanceCategory::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceCategory::Exceptional => "exceptional",
            PerformanceCategory::Exceeding => "exceeding",
            PerformanceCategory::Excellent => "excellent",
            PerformanceCategory::Good => "good",
            PerformanceCategory::Acceptable => "acceptable",
            PerformanceCategory::Poor => "poor",
        }
    }
}

impl std::fmt::Display for PerformanceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_record_harvest_updates_efficiency() {
        let mut kpi = BlockKpi {
            predicted_yield_kg: dec("100"),
            actual_yield_kg: dec("40"),
            yield_efficiency_percent: dec("40"),
            total_harvests: 2,
        };

        kpi.record_harvest(dec("10"));

        assert_eq!(kpi.actual_yield_kg, dec("50"));
        assert_eq!(kpi.yield_efficiency_percent, dec("50.00"));
        assert_eq!(kpi.total_harvests, 3);
    }

    #[test]
    fn test_efficiency_zero_without_prediction() {
        assert_eq!(yield_efficiency(dec("50"), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(yield_efficiency(dec("50"), dec("-1")), Decimal::ZERO);
    }

    #[test]
    fn test_efficiency_rounds_to_two_places() {
        assert_eq!(yield_efficiency(dec("1"), dec("3")), dec("33.33"));
        assert_eq!(yield_efficiency(dec("2"), dec("3")), dec("66.67"));
    }

    #[test]
    fn test_remove_harvest_never_negative() {
        let mut kpi = BlockKpi::with_prediction(dec("10"));
        kpi.remove_harvest(dec("5"));
        assert_eq!(kpi.actual_yield_kg, Decimal::ZERO);
        assert_eq!(kpi.total_harvests, 0);
        assert_eq!(kpi.yield_efficiency_percent, Decimal::ZERO);
    }

    #[test]
    fn test_resum_replaces_totals() {
        let mut kpi = BlockKpi::with_prediction(dec("200"));
        kpi.record_harvest(dec("10.1"));
        kpi.record_harvest(dec("20.2"));

        kpi.resum(vec![dec("10.1"), dec("25")]);

        assert_eq!(kpi.actual_yield_kg, dec("35.1"));
        assert_eq!(kpi.total_harvests, 2);
        assert_eq!(kpi.yield_efficiency_percent, dec("17.55"));
    }

    #[test]
    fn test_unusual_efficiency_is_kept() {
        let mut kpi = BlockKpi::with_prediction(dec("1"));
        kpi.record_harvest(dec("20"));
        assert_eq!(kpi.yield_efficiency_percent, dec("2000"));
        assert!(kpi.is_unusual());
    }

    #[test]
    fn test_performance_bands() {
        assert_eq!(PerformanceCategory::from_efficiency(dec("250")), PerformanceCategory::Exceptional);
        assert_eq!(PerformanceCategory::from_efficiency(dec("200")), PerformanceCategory::Exceptional);
        assert_eq!(PerformanceCategory::from_efficiency(dec("199.99")), PerformanceCategory::Exceeding);
        assert_eq!(PerformanceCategory::from_efficiency(dec("100")), PerformanceCategory::Exceeding);
        assert_eq!(PerformanceCategory::from_efficiency(dec("95")), PerformanceCategory::Excellent);
        assert_eq!(PerformanceCategory::from_efficiency(dec("70")), PerformanceCategory::Good);
        assert_eq!(PerformanceCategory::from_efficiency(dec("69.99")), PerformanceCategory::Acceptable);
        assert_eq!(PerformanceCategory::from_efficiency(dec("49.99")), PerformanceCategory::Poor);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn quantity() -> impl Strategy<Value = Decimal> {
            (1..=100_000i64).prop_map(|n| Decimal::new(n, 2))
        }

        proptest! {
            #[test]
            fn efficiency_is_never_negative(
                actual in (-1_000_000i64..=1_000_000).prop_map(|n| Decimal::new(n, 2)),
                predicted in (-1_000_000i64..=1_000_000).prop_map(|n| Decimal::new(n, 2)),
            ) {
                let efficiency = yield_efficiency(actual, predicted);
                prop_assert!(efficiency >= Decimal::ZERO);
                if predicted <= Decimal::ZERO {
                    prop_assert_eq!(efficiency, Decimal::ZERO);
                }
            }

            #[test]
            fn record_then_remove_returns_to_start(
                recorded in prop::collection::vec(quantity(), 1..20),
            ) {
                let mut kpi = BlockKpi::with_prediction(Decimal::from(500));
                for q in &recorded {
                    kpi.record_harvest(*q);
                }
                for q in &recorded {
                    kpi.remove_harvest(*q);
                }
                prop_assert_eq!(kpi.actual_yield_kg, Decimal::ZERO);
                prop_assert_eq!(kpi.total_harvests, 0);
                prop_assert_eq!(kpi.yield_efficiency_percent, Decimal::ZERO);
            }
        }
    }
}
