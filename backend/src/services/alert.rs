//! Block alert service
//!
//! Raising an alert interrupts the block (status ALERT, previous status
//! remembered). Resolving the last active alert resumes the interrupted status.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    apply_status_change, Actor, Alert, AlertSeverity, AlertStatus, Block, BlockStatus,
    StatusChangeRequest,
};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;
use validator::Validate;

use super::block::{lock_block, save_block};
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct AlertService {
    db: PgPool,
}

fn default_change_block_status() -> bool {
    true
}

/// Input for raising an alert
#[derive(Debug, Deserialize, Validate)]
pub struct CreateAlertInput {
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    pub title: String,
    #[validate(length(max = 2000, message = "Description must be at most 2000 characters"))]
    pub description: Option<String>,
    pub severity: AlertSeverity,
    /// Move the block into ALERT; on by default
    #[serde(default = "default_change_block_status")]
    pub change_block_status: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResolveAlertInput {
    #[validate(length(max = 2000, message = "Resolution notes must be at most 2000 characters"))]
    pub resolution_notes: Option<String>,
}

/// An alert write together with the block state it left behind
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertResult {
    pub alert: Alert,
    pub block: Block,
}

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    alert_id: Uuid,
    block_id: Uuid,
    farm_id: Uuid,
    title: String,
    description: Option<String>,
    severity: String,
    status: String,
    triggered_by: Uuid,
    triggered_at: DateTime<Utc>,
    resolved_by: Option<Uuid>,
    resolved_at: Option<DateTime<Utc>>,
    resolution_notes: Option<String>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = AppError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(Alert {
            alert_id: row.alert_id,
            block_id: row.block_id,
            farm_id: row.farm_id,
            title: row.title,
            description: row.description,
            severity: AlertSeverity::from_str(&row.severity).map_err(AppError::Internal)?,
            status: AlertStatus::from_str(&row.status).map_err(AppError::Internal)?,
            triggered_by: row.triggered_by,
            triggered_at: row.triggered_at,
            resolved_by: row.resolved_by,
            resolved_at: row.resolved_at,
            resolution_notes: row.resolution_notes,
        })
    }
}

const ALERT_COLUMNS: &str = r#"
    alert_id, block_id, farm_id, title, description, severity, status,
    triggered_by, triggered_at, resolved_by, resolved_at, resolution_notes
"#;

impl AlertService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn create_alert(
        &self,
        block_id: Uuid,
        input: CreateAlertInput,
        actor: &Actor,
    ) -> AppResult<AlertResult> {
        input.validate()?;

        let mut tx = self.db.begin().await?;
        let mut block = lock_block(&mut tx, block_id).await?;
        let now = Utc::now();

        let alert = Alert {
            alert_id: Uuid::new_v4(),
            block_id,
            farm_id: block.farm_id,
            title: input.title.trim().to_string(),
            description: input.description,
            severity: input.severity,
            status: AlertStatus::Open,
            triggered_by: actor.user_id,
            triggered_at: now,
            resolved_by: None,
            resolved_at: None,
            resolution_notes: None,
        };

        sqlx::query(
            r#"
            INSERT INTO block_alerts (
                alert_id, block_id, farm_id, title, description, severity, status,
                triggered_by, triggered_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(alert.alert_id)
        .bind(alert.block_id)
        .bind(alert.farm_id)
        .bind(&alert.title)
        .bind(&alert.description)
        .bind(alert.severity.as_str())
        .bind(alert.status.as_str())
        .bind(alert.triggered_by)
        .bind(alert.triggered_at)
        .execute(&mut *tx)
        .await?;

        if input.change_block_status && block.status != BlockStatus::Alert {
            let request = StatusChangeRequest::to(BlockStatus::Alert)
                .with_notes(format!("Alert raised: {}", alert.title));
            block = apply_status_change(&block, &request, actor, None, now)?.block;
            save_block(&mut *tx, &block).await?;
        }

        tx.commit().await?;

        tracing::info!(
            block_id = %block_id,
            alert_id = %alert.alert_id,
            severity = alert.severity.as_str(),
            "Alert raised"
        );

        Ok(AlertResult { alert, block })
    }

    /// Alerts of a block, newest first, optionally filtered by status
    pub async fn list_alerts(
        &self,
        block_id: Uuid,
        status: Option<AlertStatus>,
    ) -> AppResult<Vec<Alert>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM block_alerts
            WHERE block_id = $1 AND ($2::VARCHAR IS NULL OR status = $2)
            ORDER BY triggered_at DESC
            "#,
            ALERT_COLUMNS
        );
        let rows = sqlx::query_as::<_, AlertRow>(&sql)
            .bind(block_id)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.db)
            .await?;

        rows.into_iter().map(Alert::try_from).collect()
    }

    /// Resolve an alert; the block leaves ALERT once no active alert remains
    pub async fn resolve_alert(
        &self,
        alert_id: Uuid,
        input: ResolveAlertInput,
        actor: &Actor,
    ) -> AppResult<AlertResult> {
        input.validate()?;

        let existing = fetch_alert(&self.db, alert_id).await?;
        if !existing.is_active() {
            return Err(AppError::validation("status", "Alert is already resolved"));
        }

        let mut tx = self.db.begin().await?;
        let mut block = lock_block(&mut tx, existing.block_id).await?;
        let now = Utc::now();

        let sql = format!(
            r#"
            UPDATE block_alerts SET
                status = $2,
                resolved_by = $3,
                resolved_at = $4,
                resolution_notes = $5
            WHERE alert_id = $1 AND status <> $2
            RETURNING {}
            "#,
            ALERT_COLUMNS
        );
        let alert: Alert = sqlx::query_as::<_, AlertRow>(&sql)
            .bind(alert_id)
            .bind(AlertStatus::Resolved.as_str())
            .bind(actor.user_id)
            .bind(now)
            .bind(&input.resolution_notes)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::validation("status", "Alert is already resolved"))?
            .try_into()?;

        let remaining = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM block_alerts WHERE block_id = $1 AND status <> $2",
        )
        .bind(block.block_id)
        .bind(AlertStatus::Resolved.as_str())
        .fetch_one(&mut *tx)
        .await?;

        if remaining == 0 && block.status == BlockStatus::Alert {
            if let Some(previous) = block.previous_status {
                let request = StatusChangeRequest::to(previous).with_notes("All alerts resolved");
                let applied = apply_status_change(&block, &request, actor, None, now)?;
                block = applied.block;
                save_block(&mut *tx, &block).await?;
                tracing::info!(block_id = %block.block_id, status = %block.status, "Block resumed after alerts");
            }
        }

        tx.commit().await?;

        tracing::info!(alert_id = %alert_id, block_id = %alert.block_id, "Alert resolved");

        Ok(AlertResult { alert, block })
    }
}

async fn fetch_alert<'e, E>(executor: E, alert_id: Uuid) -> AppResult<Alert>
where
    E: PgExecutor<'e>,
{
    let sql = format!("SELECT {} FROM block_alerts WHERE alert_id = $1", ALERT_COLUMNS);
    sqlx::query_as::<_, AlertRow>(&sql)
        .bind(alert_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| AppError::NotFound("Alert".to_string()))?
        .try_into()
}

/// Alerts raised on a block at or after `since`; all of them without `since`
pub(crate) async fn alerts_since<'e, E>(
    executor: E,
    block_id: Uuid,
    since: Option<DateTime<Utc>>,
) -> AppResult<Vec<Alert>>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        r#"
        SELECT {}
        FROM block_alerts
        WHERE block_id = $1 AND ($2::TIMESTAMPTZ IS NULL OR triggered_at >= $2)
        ORDER BY triggered_at ASC
        "#,
        ALERT_COLUMNS
    );
    let rows = sqlx::query_as::<_, AlertRow>(&sql)
        .bind(block_id)
        .bind(since)
        .fetch_all(executor)
        .await?;

    rows.into_iter().map(Alert::try_from).collect()
}
