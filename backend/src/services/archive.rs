//! Completed-cycle archives

use shared::BlockArchive;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct ArchiveService {
    db: PgPool,
}

impl ArchiveService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Archives of a block, most recent cycle first
    pub async fn list_archives(&self, block_id: Uuid) -> AppResult<Vec<BlockArchive>> {
        let snapshots = sqlx::query_scalar::<_, Json<BlockArchive>>(
            r#"
            SELECT snapshot
            FROM block_archives
            WHERE block_id = $1
            ORDER BY archived_at DESC
            "#,
        )
        .bind(block_id)
        .fetch_all(&self.db)
        .await?;

        Ok(snapshots.into_iter().map(|s| s.0).collect())
    }

    pub async fn get_archive(&self, archive_id: Uuid) -> AppResult<BlockArchive> {
        sqlx::query_scalar::<_, Json<BlockArchive>>(
            "SELECT snapshot FROM block_archives WHERE archive_id = $1",
        )
        .bind(archive_id)
        .fetch_optional(&self.db)
        .await?
        .map(|s| s.0)
        .ok_or_else(|| AppError::NotFound("Archive".to_string()))
    }
}

/// Insert an archive; a second archive for the same cycle is rejected by the
/// unique `cycle_id` constraint
pub(crate) async fn insert_archive<'e, E>(executor: E, archive: &BlockArchive) -> AppResult<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO block_archives (
            archive_id, block_id, farm_id, cycle_id, block_code, target_crop_name,
            planted_date, actual_yield_kg, yield_efficiency_percent, performance_category,
            archived_at, snapshot
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(archive.archive_id)
    .bind(archive.block_id)
    .bind(archive.farm_id)
    .bind(archive.cycle_id)
    .bind(&archive.block_code)
    .bind(&archive.target_crop_name)
    .bind(archive.planted_date)
    .bind(archive.actual_yield_kg)
    .bind(archive.yield_efficiency_percent)
    .bind(archive.performance_category.as_str())
    .bind(archive.archived_at)
    .bind(Json(archive))
    .execute(executor)
    .await?;

    Ok(())
}
