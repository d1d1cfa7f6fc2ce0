use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::domain::{
    ExecutionPhase, HedgeLeg, HedgePosition, PnlReport, PositionFault, PositionId, PositionPatch,
    PositionStatus,
};
use crate::error::{HedgeError, Result};

use super::{apply_patch, HedgePositionStore};

const SELECT_COLUMNS: &str = r#"
    SELECT id, symbol, primary_leg, hedge_leg, take_profit_percent, stop_loss_percent,
           funding_time_ms, phase, status, error_message, fault, pnl,
           created_at, opened_at, completed_at
    FROM hedge_positions
"#;

/// PostgreSQL position store
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode_position(row: &PgRow) -> Result<HedgePosition> {
    let phase: String = row.try_get("phase")?;
    let status: String = row.try_get("status")?;
    let primary: Json<HedgeLeg> = row.try_get("primary_leg")?;
    let hedge: Json<HedgeLeg> = row.try_get("hedge_leg")?;
    let fault: Option<Json<PositionFault>> = row.try_get("fault")?;
    let pnl: Option<Json<PnlReport>> = row.try_get("pnl")?;

    Ok(HedgePosition {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        primary: primary.0,
        hedge: hedge.0,
        take_profit_percent: row.try_get("take_profit_percent")?,
        stop_loss_percent: row.try_get("stop_loss_percent")?,
        funding_time_ms: row.try_get("funding_time_ms")?,
        phase: ExecutionPhase::try_from(phase.as_str()).map_err(HedgeError::Internal)?,
        status: PositionStatus::try_from(status.as_str()).map_err(HedgeError::Internal)?,
        error_message: row.try_get("error_message")?,
        fault: fault.map(|f| f.0),
        pnl: pnl.map(|p| p.0),
        created_at: row.try_get("created_at")?,
        opened_at: row.try_get("opened_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl HedgePositionStore for PostgresStore {
    #[instrument(skip(self, position), fields(position_id = %position.id))]
    async fn create(&self, position: &HedgePosition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hedge_positions (
                id, symbol, primary_leg, hedge_leg, take_profit_percent, stop_loss_percent,
                funding_time_ms, phase, status, error_message, fault, pnl,
                created_at, opened_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(position.id)
        .bind(&position.symbol)
        .bind(Json(&position.primary))
        .bind(Json(&position.hedge))
        .bind(position.take_profit_percent)
        .bind(position.stop_loss_percent)
        .bind(position.funding_time_ms)
        .bind(position.phase.as_str())
        .bind(position.status.as_str())
        .bind(&position.error_message)
        .bind(position.fault.as_ref().map(Json))
        .bind(position.pnl.as_ref().map(Json))
        .bind(position.created_at)
        .bind(position.opened_at)
        .bind(position.completed_at)
        .execute(&self.pool)
        .await?;

        debug!("position created");
        Ok(())
    }

    async fn get(&self, id: PositionId) -> Result<Option<HedgePosition>> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_position).transpose()
    }

    /// Read-modify-write under a row lock
    #[instrument(skip(self, patch))]
    async fn update(&self, id: PositionId, patch: &PositionPatch) -> Result<HedgePosition> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!("{} WHERE id = $1 FOR UPDATE", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(HedgeError::PositionNotFound(id))?;
        let mut position = decode_position(&row)?;
        apply_patch(&mut position, patch)?;

        sqlx::query(
            r#"
            UPDATE hedge_positions SET
                primary_leg = $2,
                hedge_leg = $3,
                phase = $4,
                status = $5,
                error_message = $6,
                fault = $7,
                pnl = $8,
                opened_at = $9,
                completed_at = $10,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(&position.primary))
        .bind(Json(&position.hedge))
        .bind(position.phase.as_str())
        .bind(position.status.as_str())
        .bind(&position.error_message)
        .bind(position.fault.as_ref().map(Json))
        .bind(position.pnl.as_ref().map(Json))
        .bind(position.opened_at)
        .bind(position.completed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(position)
    }

    async fn find_by_status(&self, statuses: &[PositionStatus]) -> Result<Vec<HedgePosition>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "{} WHERE status = ANY($1) ORDER BY created_at ASC",
            SELECT_COLUMNS
        ))
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_position).collect()
    }
}
