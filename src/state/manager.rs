//! PostgreSQL parcel store

use super::{ParcelStats, ParcelStore};
use crate::config::DatabaseConfig;
use crate::error::{ZeroError, ZeroResult};
use crate::lifecycle::LoanProgress;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

/// Parcel store backed by PostgreSQL
pub struct PgParcelStore {
    pool: PgPool,
}

impl PgParcelStore {
    /// Connect to the configured database
    pub async fn new(config: &DatabaseConfig) -> ZeroResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> ZeroResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS loan_parcels (
                deposit_address VARCHAR(100) PRIMARY KEY,
                borrower VARCHAR(42) NOT NULL,
                proxy_address VARCHAR(42) NOT NULL,
                state VARCHAR(32) NOT NULL,
                timeout_expiry BIGINT,
                progress JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_loan_parcels_state
            ON loan_parcels (state)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn decode_progress(row: &PgRow) -> ZeroResult<LoanProgress> {
    let raw: serde_json::Value = row.try_get("progress")?;
    Ok(serde_json::from_value(raw)?)
}

#[async_trait]
impl ParcelStore for PgParcelStore {
    async fn save(&self, progress: &LoanProgress) -> ZeroResult<()> {
        let payload = serde_json::to_value(progress)?;
        let state = progress.state();

        sqlx::query(
            r#"
            INSERT INTO loan_parcels
                (deposit_address, borrower, proxy_address, state, timeout_expiry, progress)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (deposit_address)
            DO UPDATE SET state = $4, timeout_expiry = $5, progress = $6, updated_at = NOW()
            "#,
        )
        .bind(progress.key())
        .bind(format!("{:?}", progress.parcel.request.borrower))
        .bind(format!("{:?}", progress.parcel.proxy_address()))
        .bind(state.as_str())
        .bind(progress.timeout_expiry.map(|b| b as i64))
        .bind(payload)
        .execute(&self.pool)
        .await?;

        debug!("Saved parcel {} as {}", progress.key(), state);
        Ok(())
    }

    async fn load(&self, deposit_address: &str) -> ZeroResult<Option<LoanProgress>> {
        let row = sqlx::query("SELECT progress FROM loan_parcels WHERE deposit_address = $1")
            .bind(deposit_address)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_progress).transpose()
    }

    async fn unfinished(&self) -> ZeroResult<Vec<LoanProgress>> {
        let rows = sqlx::query(
            r#"
            SELECT progress FROM loan_parcels
            WHERE state NOT IN ('repaid', 'defaulted')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_progress).collect()
    }

    async fn list(&self, limit: usize) -> ZeroResult<Vec<LoanProgress>> {
        let rows = sqlx::query("SELECT progress FROM loan_parcels ORDER BY updated_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode_progress).collect()
    }

    async fn stats(&self) -> ZeroResult<ParcelStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state IN ('created', 'parceled')) as parceled,
                COUNT(*) FILTER (WHERE state = 'deposited') as deposited,
                COUNT(*) FILTER (WHERE state = 'attestation_pending') as attestation_pending,
                COUNT(*) FILTER (WHERE state = 'attested') as attested,
                COUNT(*) FILTER (WHERE state = 'borrowed') as borrowed,
                COUNT(*) FILTER (WHERE state = 'repaid') as repaid,
                COUNT(*) FILTER (WHERE state = 'defaulted') as defaulted,
                MAX(updated_at) as last_update
            FROM loan_parcels
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ParcelStats {
            parceled: row.get::<i64, _>("parceled") as u64,
            deposited: row.get::<i64, _>("deposited") as u64,
            attestation_pending: row.get::<i64, _>("attestation_pending") as u64,
            attested: row.get::<i64, _>("attested") as u64,
            borrowed: row.get::<i64, _>("borrowed") as u64,
            repaid: row.get::<i64, _>("repaid") as u64,
            defaulted: row.get::<i64, _>("defaulted") as u64,
            last_update: row.get::<Option<DateTime<Utc>>, _>("last_update"),
        })
    }

    async fn health_check(&self) -> ZeroResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(ZeroError::Database)?;
        Ok(())
    }
}
