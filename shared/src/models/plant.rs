//! Plant growth-cycle reference data

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Growth durations and expected yield for one crop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlantGrowthCycle {
    pub plant_id: Uuid,
    pub name: String,
    pub germination_days: i64,
    pub vegetative_days: i64,
    pub flowering_days: i64,
    pub fruiting_days: i64,
    pub harvest_duration_days: i64,
    pub expected_yield_per_plant_kg: Decimal,
}

impl PlantGrowthCycle {
    /// Days from planting to the first expected harvest
    pub fn days_to_harvest(&self) -> i64 {
        self.germination_days + self.vegetative_days + self.flowering_days + self.fruiting_days
    }

    /// Days from planting until cleaning is expected to start
    pub fn total_cycle_days(&self) -> i64 {
        self.days_to_harvest() + self.harvest_duration_days
    }
}
