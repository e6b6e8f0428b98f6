//! Block lifecycle service
//!
//! Loads blocks, applies the pure lifecycle rules from `shared`, and persists
//! the result. A status change that completes a cycle writes the archive and
//! the reset block in one transaction.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shared::{
    apply_status_change, archive_completed_cycle, calculate_dashboard_metrics, Actor, Block,
    BlockArchive, BlockDashboardMetrics, BlockKpi, BlockStateMachine, BlockStatus, Farm,
    StatusChange, StatusChangeRequest,
};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;
use validator::Validate;

use super::alert::alerts_since;
use super::archive::insert_archive;
use super::harvest::cycle_harvests;
use super::plant_data::find_plant;
use crate::error::{AppError, AppResult};

#[derive(Debug, sqlx::FromRow)]
struct FarmRow {
    farm_id: Uuid,
    farm_code: String,
    name: String,
    next_block_sequence: i32,
    created_at: DateTime<Utc>,
}

impl From<FarmRow> for Farm {
    fn from(row: FarmRow) -> Self {
        Farm {
            farm_id: row.farm_id,
            farm_code: row.farm_code,
            name: row.name,
            next_block_sequence: row.next_block_sequence,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct BlockService {
    db: PgPool,
}

/// Input for creating a block
#[derive(Debug, Deserialize, Validate)]
pub struct CreateBlockInput {
    #[validate(length(min = 1, max = 200, message = "Block name must be 1-200 characters"))]
    pub name: String,
    #[validate(range(min = 0, message = "Max plants cannot be negative"))]
    pub max_plants: i32,
    pub area: Option<Decimal>,
}

/// Input for a status change
#[derive(Debug, Deserialize, Validate)]
pub struct ChangeStatusInput {
    pub status: BlockStatus,
    #[validate(length(max = 1000, message = "Notes must be at most 1000 characters"))]
    pub notes: Option<String>,
    pub target_crop: Option<Uuid>,
    pub actual_plant_count: Option<i32>,
}

impl ChangeStatusInput {
    fn to_request(&self) -> StatusChangeRequest {
        StatusChangeRequest {
            new_status: self.status,
            notes: self.notes.clone(),
            target_crop: self.target_crop,
            actual_plant_count: self.actual_plant_count,
        }
    }
}

/// Outcome of a status change
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeResult {
    pub block: Block,
    /// Present when the change completed a cycle
    pub archive: Option<BlockArchive>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTransitions {
    pub block_id: Uuid,
    pub current_status: BlockStatus,
    pub previous_status: Option<BlockStatus>,
    pub valid_transitions: Vec<BlockStatus>,
}

/// Database row for a block
#[derive(Debug, sqlx::FromRow)]
struct BlockRow {
    block_id: Uuid,
    farm_id: Uuid,
    farm_code: String,
    block_code: String,
    sequence_number: i32,
    name: String,
    max_plants: i32,
    area: Option<Decimal>,
    status: String,
    previous_status: Option<String>,
    cycle_id: Option<Uuid>,
    target_crop: Option<Uuid>,
    target_crop_name: Option<String>,
    actual_plant_count: Option<i32>,
    planted_date: Option<DateTime<Utc>>,
    expected_harvest_date: Option<DateTime<Utc>>,
    expected_status_changes: Json<BTreeMap<BlockStatus, DateTime<Utc>>>,
    predicted_yield_kg: Decimal,
    actual_yield_kg: Decimal,
    yield_efficiency_percent: Decimal,
    total_harvests: i32,
    status_changes: Json<Vec<StatusChange>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BlockRow> for Block {
    type Error = AppError;

    fn try_from(row: BlockRow) -> Result<Self, Self::Error> {
        let status = BlockStatus::from_str(&row.status).map_err(AppError::Internal)?;
        let previous_status = row
            .previous_status
            .as_deref()
            .map(BlockStatus::from_str)
            .transpose()
            .map_err(AppError::Internal)?;

        Ok(Block {
            block_id: row.block_id,
            farm_id: row.farm_id,
            farm_code: row.farm_code,
            block_code: row.block_code,
            sequence_number: row.sequence_number,
            name: row.name,
            max_plants: row.max_plants,
            area: row.area,
            status,
            previous_status,
            cycle_id: row.cycle_id,
            target_crop: row.target_crop,
            target_crop_name: row.target_crop_name,
            actual_plant_count: row.actual_plant_count,
            planted_date: row.planted_date,
            expected_harvest_date: row.expected_harvest_date,
            expected_status_changes: row.expected_status_changes.0,
            kpi: BlockKpi {
                predicted_yield_kg: row.predicted_yield_kg,
                actual_yield_kg: row.actual_yield_kg,
                yield_efficiency_percent: row.yield_efficiency_percent,
                total_harvests: row.total_harvests,
            },
            status_changes: row.status_changes.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const BLOCK_COLUMNS: &str = r#"
    block_id, farm_id, farm_code, block_code, sequence_number, name, max_plants, area,
    status, previous_status, cycle_id, target_crop, target_crop_name, actual_plant_count,
    planted_date, expected_harvest_date, expected_status_changes,
    predicted_yield_kg, actual_yield_kg, yield_efficiency_percent, total_harvests,
    status_changes, created_at, updated_at
"#;

impl BlockService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Create an EMPTY block with the next sequence number of its farm
    pub async fn create_block(
        &self,
        farm_id: Uuid,
        input: CreateBlockInput,
        actor: &Actor,
    ) -> AppResult<Block> {
        input.validate()?;
        shared::validate_block_name(&input.name).map_err(|m| AppError::validation("name", m))?;
        shared::validate_max_plants(input.max_plants)
            .map_err(|m| AppError::validation("max_plants", m))?;
        shared::validate_area(input.area).map_err(|m| AppError::validation("area", m))?;

        let mut tx = self.db.begin().await?;

        let farm: Farm = sqlx::query_as::<_, FarmRow>(
            r#"
            UPDATE farms
            SET next_block_sequence = next_block_sequence + 1
            WHERE farm_id = $1
            RETURNING farm_id, farm_code, name, next_block_sequence, created_at
            "#,
        )
        .bind(farm_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound("Farm".to_string()))?
        .into();

        let block = Block::new_empty(
            farm.farm_id,
            &farm.farm_code,
            farm.next_block_sequence,
            input.name.trim().to_string(),
            input.max_plants,
            input.area,
            actor,
            Utc::now(),
        );

        sqlx::query(
            r#"
            INSERT INTO blocks (
                block_id, farm_id, farm_code, block_code, sequence_number, name, max_plants, area,
                status, status_changes, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(block.block_id)
        .bind(block.farm_id)
        .bind(&block.farm_code)
        .bind(&block.block_code)
        .bind(block.sequence_number)
        .bind(&block.name)
        .bind(block.max_plants)
        .bind(block.area)
        .bind(block.status.as_str())
        .bind(Json(&block.status_changes))
        .bind(block.created_at)
        .bind(block.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            block_id = %block.block_id,
            block_code = %block.block_code,
            "Block created"
        );

        Ok(block)
    }

    pub async fn get_block(&self, block_id: Uuid) -> AppResult<Block> {
        fetch_block(&self.db, block_id).await
    }

    /// Blocks of a farm, optionally filtered by status
    pub async fn list_blocks(
        &self,
        farm_id: Uuid,
        status: Option<BlockStatus>,
    ) -> AppResult<Vec<Block>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM blocks
            WHERE farm_id = $1 AND ($2::VARCHAR IS NULL OR status = $2)
            ORDER BY sequence_number ASC
            "#,
            BLOCK_COLUMNS
        );
        let rows = sqlx::query_as::<_, BlockRow>(&sql)
            .bind(farm_id)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.db)
            .await?;

        rows.into_iter().map(Block::try_from).collect()
    }

    pub async fn get_transitions(&self, block_id: Uuid) -> AppResult<BlockTransitions> {
        let block = self.get_block(block_id).await?;
        Ok(BlockTransitions {
            block_id: block.block_id,
            current_status: block.status,
            previous_status: block.previous_status,
            valid_transitions: BlockStateMachine::valid_transitions(block.status),
        })
    }

    pub async fn get_metrics(&self, block_id: Uuid) -> AppResult<BlockDashboardMetrics> {
        let block = self.get_block(block_id).await?;
        let plant = match block.target_crop {
            Some(plant_id) => find_plant(&self.db, plant_id).await?,
            None => None,
        };
        Ok(calculate_dashboard_metrics(&block, plant.as_ref(), Utc::now()))
    }

    /// Move a block to a new status.
    ///
    /// Ending a planted cycle (back to EMPTY, or re-planting from ALERT)
    /// archives that cycle in the same transaction as the block update; if
    /// archiving fails the block is unchanged.
    pub async fn change_status(
        &self,
        block_id: Uuid,
        input: ChangeStatusInput,
        actor: &Actor,
    ) -> AppResult<StatusChangeResult> {
        input.validate()?;
        let request = input.to_request();

        let mut tx = self.db.begin().await?;
        let block = lock_block(&mut tx, block_id).await?;

        let resuming = block.status == BlockStatus::Alert
            && block.previous_status == Some(request.new_status);
        let plant = match request.target_crop {
            Some(plant_id) if request.new_status == BlockStatus::Planted && !resuming => Some(
                find_plant(&mut *tx, plant_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound("Plant".to_string()))?,
            ),
            _ => None,
        };

        let now = Utc::now();
        let applied = apply_status_change(&block, &request, actor, plant.as_ref(), now)?;

        let archive = match &applied.completed_cycle {
            Some(completed) => {
                let archive = build_archive(&mut tx, completed, actor, now).await?;
                if let Some(archive) = &archive {
                    insert_archive(&mut *tx, archive).await?;
                }
                archive
            }
            None => None,
        };

        save_block(&mut *tx, &applied.block).await?;
        tx.commit().await?;

        tracing::info!(
            block_id = %block_id,
            from = %block.status,
            to = %applied.block.status,
            "Block status changed"
        );
        if let Some(archive) = &archive {
            tracing::info!(
                block_id = %block_id,
                archive_id = %archive.archive_id,
                cycle_id = %archive.cycle_id,
                efficiency = %archive.yield_efficiency_percent,
                "Cycle archived"
            );
        }

        Ok(StatusChangeResult {
            block: applied.block,
            archive,
        })
    }
}

async fn build_archive(
    tx: &mut Transaction<'_, Postgres>,
    completed: &Block,
    actor: &Actor,
    now: DateTime<Utc>,
) -> AppResult<Option<BlockArchive>> {
    let Some(cycle_id) = completed.cycle_id else {
        return Ok(None);
    };
    let harvests = cycle_harvests(&mut **tx, completed.block_id, cycle_id).await?;
    let alerts = alerts_since(&mut **tx, completed.block_id, completed.planted_date).await?;
    Ok(archive_completed_cycle(completed, &harvests, &alerts, actor, now))
}

/// Load a block without locking
pub(crate) async fn fetch_block<'e, E>(executor: E, block_id: Uuid) -> AppResult<Block>
where
    E: PgExecutor<'e>,
{
    let sql = format!("SELECT {} FROM blocks WHERE block_id = $1", BLOCK_COLUMNS);
    sqlx::query_as::<_, BlockRow>(&sql)
        .bind(block_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| AppError::NotFound("Block".to_string()))?
        .try_into()
}

/// Load a block and hold its row lock until the transaction ends
pub(crate) async fn lock_block(
    tx: &mut Transaction<'_, Postgres>,
    block_id: Uuid,
) -> AppResult<Block> {
    let sql = format!("SELECT {} FROM blocks WHERE block_id = $1 FOR UPDATE", BLOCK_COLUMNS);
    sqlx::query_as::<_, BlockRow>(&sql)
        .bind(block_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound("Block".to_string()))?
        .try_into()
}

/// Persist every mutable field of `block`
pub(crate) async fn save_block<'e, E>(executor: E, block: &Block) -> AppResult<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        UPDATE blocks SET
            status = $2,
            previous_status = $3,
            cycle_id = $4,
            target_crop = $5,
            target_crop_name = $6,
            actual_plant_count = $7,
            planted_date = $8,
            expected_harvest_date = $9,
            expected_status_changes = $10,
            predicted_yield_kg = $11,
            actual_yield_kg = $12,
            yield_efficiency_percent = $13,
            total_harvests = $14,
            status_changes = $15,
            updated_at = $16
        WHERE block_id = $1
        "#,
    )
    .bind(block.block_id)
    .bind(block.status.as_str())
    .bind(block.previous_status.map(|s| s.as_str()))
    .bind(block.cycle_id)
    .bind(block.target_crop)
    .bind(&block.target_crop_name)
    .bind(block.actual_plant_count)
    .bind(block.planted_date)
    .bind(block.expected_harvest_date)
    .bind(Json(&block.expected_status_changes))
    .bind(block.kpi.predicted_yield_kg)
    .bind(block.kpi.actual_yield_kg)
    .bind(block.kpi.yield_efficiency_percent)
    .bind(block.kpi.total_harvests)
    .bind(Json(&block.status_changes))
    .bind(block.updated_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Persist only the KPI columns of a block
pub(crate) async fn save_kpi<'e, E>(executor: E, block_id: Uuid, kpi: &BlockKpi) -> AppResult<()>
where
    E: PgExecutor<'e>,
{
    if kpi.is_unusual() {
        tracing::warn!(
            block_id = %block_id,
            efficiency = %kpi.yield_efficiency_percent,
            "Unusual yield efficiency"
        );
    }

    sqlx::query(
        r#"
        UPDATE blocks SET
            actual_yield_kg = $2,
            yield_efficiency_percent = $3,
            total_harvests = $4,
            updated_at = NOW()
        WHERE block_id = $1
        "#,
    )
    .bind(block_id)
    .bind(kpi.actual_yield_kg)
    .bind(kpi.yield_efficiency_percent)
    .bind(kpi.total_harvests)
    .execute(executor)
    .await?;

    Ok(())
}
