//! Harvest recording service
//!
//! Every harvest write updates the block KPI in the same transaction.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shared::{Actor, BlockHarvest, BlockKpi, BlockStatus, QualityGrade};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;
use validator::Validate;

use super::block::{lock_block, save_kpi};
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct HarvestService {
    db: PgPool,
}

/// Input for recording a harvest
#[derive(Debug, Deserialize, Validate)]
pub struct RecordHarvestInput {
    pub quantity_kg: Decimal,
    pub quality_grade: QualityGrade,
    /// Defaults to now
    pub harvested_at: Option<DateTime<Utc>>,
    #[validate(length(max = 1000, message = "Notes must be at most 1000 characters"))]
    pub notes: Option<String>,
}

/// Input for correcting a harvest
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateHarvestInput {
    pub quantity_kg: Option<Decimal>,
    pub quality_grade: Option<QualityGrade>,
    #[validate(length(max = 1000, message = "Notes must be at most 1000 characters"))]
    pub notes: Option<String>,
}

/// A harvest write together with the block KPI it produced
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestResult {
    pub harvest: BlockHarvest,
    /// `None` when the harvest belongs to an already archived cycle
    pub kpi: Option<BlockKpi>,
}

#[derive(Debug, sqlx::FromRow)]
struct HarvestRow {
    harvest_id: Uuid,
    block_id: Uuid,
    cycle_id: Uuid,
    quantity_kg: Decimal,
    quality_grade: String,
    harvested_by: Uuid,
    harvested_by_email: String,
    harvested_at: DateTime<Utc>,
    notes: Option<String>,
}

impl TryFrom<HarvestRow> for BlockHarvest {
    type Error = AppError;

    fn try_from(row: HarvestRow) -> Result<Self, Self::Error> {
        Ok(BlockHarvest {
            harvest_id: row.harvest_id,
            block_id: row.block_id,
            cycle_id: row.cycle_id,
            quantity_kg: row.quantity_kg,
            quality_grade: QualityGrade::from_str(&row.quality_grade).map_err(AppError::Internal)?,
            harvested_by: row.harvested_by,
            harvested_by_email: row.harvested_by_email,
            harvested_at: row.harvested_at,
            notes: row.notes,
        })
    }
}

const HARVEST_COLUMNS: &str = r#"
    harvest_id, block_id, cycle_id, quantity_kg, quality_grade,
    harvested_by, harvested_by_email, harvested_at, notes
"#;

fn check_quantity(quantity_kg: Decimal) -> AppResult<()> {
    shared::validate_harvest_quantity(quantity_kg).map_err(|m| AppError::validation("quantity_kg", m))
}

impl HarvestService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Record a harvest against the block's current cycle.
    ///
    /// Allowed while HARVESTING, or while in ALERT interrupted from HARVESTING.
    pub async fn record_harvest(
        &self,
        block_id: Uuid,
        input: RecordHarvestInput,
        actor: &Actor,
    ) -> AppResult<HarvestResult> {
        input.validate()?;
        check_quantity(input.quantity_kg)?;

        let mut tx = self.db.begin().await?;
        let mut block = lock_block(&mut tx, block_id).await?;

        if block.effective_status() != BlockStatus::Harvesting {
            return Err(AppError::validation(
                "status",
                format!(
                    "Harvests can only be recorded while the block is harvesting (current: {})",
                    block.status
                ),
            ));
        }
        let cycle_id = block.cycle_id.ok_or_else(|| {
            AppError::validation("status", "Block has no active planting cycle")
        })?;

        let harvest = BlockHarvest {
            harvest_id: Uuid::new_v4(),
            block_id,
            cycle_id,
            quantity_kg: input.quantity_kg,
            quality_grade: input.quality_grade,
            harvested_by: actor.user_id,
            harvested_by_email: actor.email.clone(),
            harvested_at: input.harvested_at.unwrap_or_else(Utc::now),
            notes: input.notes,
        };

        sqlx::query(
            r#"
            INSERT INTO block_harvests (
                harvest_id, block_id, cycle_id, quantity_kg, quality_grade,
                harvested_by, harvested_by_email, harvested_at, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(harvest.harvest_id)
        .bind(harvest.block_id)
        .bind(harvest.cycle_id)
        .bind(harvest.quantity_kg)
        .bind(harvest.quality_grade.as_str())
        .bind(harvest.harvested_by)
        .bind(&harvest.harvested_by_email)
        .bind(harvest.harvested_at)
        .bind(&harvest.notes)
        .execute(&mut *tx)
        .await?;

        block.kpi.record_harvest(harvest.quantity_kg);
        save_kpi(&mut *tx, block_id, &block.kpi).await?;

        tx.commit().await?;

        tracing::info!(
            block_id = %block_id,
            harvest_id = %harvest.harvest_id,
            quantity_kg = %harvest.quantity_kg,
            efficiency = %block.kpi.yield_efficiency_percent,
            "Harvest recorded"
        );

        Ok(HarvestResult {
            harvest,
            kpi: Some(block.kpi),
        })
    }

    /// Harvests of a block, newest first; limited to one cycle when given
    pub async fn list_harvests(
        &self,
        block_id: Uuid,
        cycle_id: Option<Uuid>,
    ) -> AppResult<Vec<BlockHarvest>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM block_harvests
            WHERE block_id = $1 AND ($2::UUID IS NULL OR cycle_id = $2)
            ORDER BY harvested_at DESC
            "#,
            HARVEST_COLUMNS
        );
        let rows = sqlx::query_as::<_, HarvestRow>(&sql)
            .bind(block_id)
            .bind(cycle_id)
            .fetch_all(&self.db)
            .await?;

        rows.into_iter().map(BlockHarvest::try_from).collect()
    }

    /// Correct a harvest; the block KPI is resummed from the cycle's records
    pub async fn update_harvest(
        &self,
        harvest_id: Uuid,
        input: UpdateHarvestInput,
    ) -> AppResult<HarvestResult> {
        input.validate()?;
        if let Some(quantity) = input.quantity_kg {
            check_quantity(quantity)?;
        }

        let existing = fetch_harvest(&self.db, harvest_id).await?;

        let mut tx = self.db.begin().await?;
        let mut block = lock_block(&mut tx, existing.block_id).await?;

        let sql = format!(
            r#"
            UPDATE block_harvests SET
                quantity_kg = COALESCE($2, quantity_kg),
                quality_grade = COALESCE($3, quality_grade),
                notes = COALESCE($4, notes)
            WHERE harvest_id = $1
            RETURNING {}
            "#,
            HARVEST_COLUMNS
        );
        let harvest: BlockHarvest = sqlx::query_as::<_, HarvestRow>(&sql)
            .bind(harvest_id)
            .bind(input.quantity_kg)
            .bind(input.quality_grade.map(|g| g.as_str()))
            .bind(&input.notes)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound("Harvest".to_string()))?
            .try_into()?;

        let kpi = if block.cycle_id == Some(harvest.cycle_id) {
            let quantities = cycle_quantities(&mut *tx, block.block_id, harvest.cycle_id).await?;
            block.kpi.resum(quantities);
            save_kpi(&mut *tx, block.block_id, &block.kpi).await?;
            Some(block.kpi)
        } else {
            None
        };

        tx.commit().await?;

        tracing::info!(harvest_id = %harvest_id, block_id = %harvest.block_id, "Harvest updated");

        Ok(HarvestResult { harvest, kpi })
    }

    /// Delete a harvest and take it out of the block KPI
    pub async fn delete_harvest(&self, harvest_id: Uuid) -> AppResult<HarvestResult> {
        let existing = fetch_harvest(&self.db, harvest_id).await?;

        let mut tx = self.db.begin().await?;
        let mut block = lock_block(&mut tx, existing.block_id).await?;

        let deleted = sqlx::query("DELETE FROM block_harvests WHERE harvest_id = $1")
            .bind(harvest_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(AppError::NotFound("Harvest".to_string()));
        }

        let kpi = if block.cycle_id == Some(existing.cycle_id) {
            block.kpi.remove_harvest(existing.quantity_kg);
            save_kpi(&mut *tx, block.block_id, &block.kpi).await?;
            Some(block.kpi)
        } else {
            None
        };

        tx.commit().await?;

        tracing::info!(harvest_id = %harvest_id, block_id = %existing.block_id, "Harvest deleted");

        Ok(HarvestResult {
            harvest: existing,
            kpi,
        })
    }
}

async fn fetch_harvest<'e, E>(executor: E, harvest_id: Uuid) -> AppResult<BlockHarvest>
where
    E: PgExecutor<'e>,
{
    let sql = format!("SELECT {} FROM block_harvests WHERE harvest_id = $1", HARVEST_COLUMNS);
    sqlx::query_as::<_, HarvestRow>(&sql)
        .bind(harvest_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| AppError::NotFound("Harvest".to_string()))?
        .try_into()
}

async fn cycle_quantities<'e, E>(executor: E, block_id: Uuid, cycle_id: Uuid) -> AppResult<Vec<Decimal>>
where
    E: PgExecutor<'e>,
{
    let quantities = sqlx::query_scalar::<_, Decimal>(
        "SELECT quantity_kg FROM block_harvests WHERE block_id = $1 AND cycle_id = $2",
    )
    .bind(block_id)
    .bind(cycle_id)
    .fetch_all(executor)
    .await?;

    Ok(quantities)
}

/// All harvests of one cycle, oldest first
pub(crate) async fn cycle_harvests<'e, E>(
    executor: E,
    block_id: Uuid,
    cycle_id: Uuid,
) -> AppResult<Vec<BlockHarvest>>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "SELECT {} FROM block_harvests WHERE block_id = $1 AND cycle_id = $2 ORDER BY harvested_at ASC",
        HARVEST_COLUMNS
    );
    let rows = sqlx::query_as::<_, HarvestRow>(&sql)
        .bind(block_id)
        .bind(cycle_id)
        .fetch_all(executor)
        .await?;

    rows.into_iter().map(BlockHarvest::try_from).collect()
}
