use crate::database::error::DatabaseError;
use crate::database::models::{NewProviderCallback, ProviderCallback};
use crate::database::repository::{DbResult, ProviderCallbackStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

const COLUMNS: &str = "id, provider_code, ref_id, rc, status, message, serial_number, price, \
     payload, is_processed, process_error, created_at, processed_at";

#[derive(Debug, Clone, FromRow)]
struct ProviderCallbackRow {
    id: i64,
    provider_code: String,
    ref_id: String,
    rc: Option<String>,
    status: Option<String>,
    message: Option<String>,
    serial_number: Option<String>,
    price: Option<i64>,
    payload: serde_json::Value,
    is_processed: bool,
    process_error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<ProviderCallbackRow> for ProviderCallback {
    fn from(row: ProviderCallbackRow) -> Self {
        Self {
            id: row.id,
            provider_code: row.provider_code,
            ref_id: row.ref_id,
            rc: row.rc,
            status: row.status,
            message: row.message,
            serial_number: row.serial_number,
            price: row.price,
            payload: row.payload,
            is_processed: row.is_processed,
            process_error: row.process_error,
            created_at: row.created_at,
            processed_at: row.processed_at,
        }
    }
}

/// Inbound provider pushes, stored before any processing happens.
pub struct ProviderCallbackRepository {
    pool: PgPool,
}

impl ProviderCallbackRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderCallbackStore for ProviderCallbackRepository {
    async fn insert(&self, callback: NewProviderCallback) -> DbResult<ProviderCallback> {
        let sql = format!(
            "INSERT INTO provider_callbacks
             (provider_code, ref_id, rc, status, message, serial_number, price, payload)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {}",
            COLUMNS
        );
        let row = sqlx::query_as::<_, ProviderCallbackRow>(&sql)
            .bind(&callback.provider_code)
            .bind(&callback.ref_id)
            .bind(&callback.rc)
            .bind(&callback.status)
            .bind(&callback.message)
            .bind(&callback.serial_number)
            .bind(callback.price)
            .bind(&callback.payload)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(row.into())
    }

    async fn claim_unprocessed(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<ProviderCallback>> {
        let sql = format!(
            "UPDATE provider_callbacks SET claimed_until = $2
             WHERE id IN (
                 SELECT id FROM provider_callbacks
                 WHERE is_processed = FALSE
                   AND (claimed_until IS NULL OR claimed_until <= $1)
                 ORDER BY id
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, ProviderCallbackRow>(&sql)
            .bind(now)
            .bind(claimed_until)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(rows.into_iter().map(ProviderCallback::from).collect())
    }

    async fn mark_processed(&self, id: i64, error: Option<String>) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE provider_callbacks
             SET is_processed = TRUE, process_error = $2, processed_at = NOW(), claimed_until = NULL
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("provider_callback", id));
        }
        Ok(())
    }
}
