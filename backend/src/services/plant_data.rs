//! Plant growth-cycle lookup

use rust_decimal::Decimal;
use shared::PlantGrowthCycle;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct PlantDataService {
    db: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct PlantDataRow {
    plant_id: Uuid,
    name: String,
    germination_days: i32,
    vegetative_days: i32,
    flowering_days: i32,
    fruiting_days: i32,
    harvest_duration_days: i32,
    expected_yield_per_plant_kg: Decimal,
}

impl From<PlantDataRow> for PlantGrowthCycle {
    fn from(row: PlantDataRow) -> Self {
        PlantGrowthCycle {
            plant_id: row.plant_id,
            name: row.name,
            germination_days: row.germination_days.into(),
            vegetative_days: row.vegetative_days.into(),
            flowering_days: row.flowering_days.into(),
            fruiting_days: row.fruiting_days.into(),
            harvest_duration_days: row.harvest_duration_days.into(),
            expected_yield_per_plant_kg: row.expected_yield_per_plant_kg,
        }
    }
}

impl PlantDataService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Growth cycle for `plant_id`, if the crop is known
    pub async fn find(&self, plant_id: Uuid) -> AppResult<Option<PlantGrowthCycle>> {
        find_plant(&self.db, plant_id).await
    }

    /// Growth cycle for `plant_id`, failing when the crop is unknown
    pub async fn get(&self, plant_id: Uuid) -> AppResult<PlantGrowthCycle> {
        self.find(plant_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Plant".to_string()))
    }

    pub async fn list(&self) -> AppResult<Vec<PlantGrowthCycle>> {
        let rows = sqlx::query_as::<_, PlantDataRow>(
            r#"
            SELECT plant_id, name, germination_days, vegetative_days, flowering_days,
                   fruiting_days, harvest_duration_days, expected_yield_per_plant_kg
            FROM plant_data
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Lookup usable inside a transaction
pub(crate) async fn find_plant<'e, E>(executor: E, plant_id: Uuid) -> AppResult<Option<PlantGrowthCycle>>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, PlantDataRow>(
        r#"
        SELECT plant_id, name, germination_days, vegetative_days, flowering_days,
               fruiting_days, harvest_duration_days, expected_yield_per_plant_kg
        FROM plant_data
        WHERE plant_id = $1
        "#,
    )
    .bind(plant_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(Into::into))
}
