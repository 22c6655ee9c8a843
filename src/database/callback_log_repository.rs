use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::models::{CallbackAttempt, CallbackEvent, CallbackLog, NewCallbackLog};
use crate::database::repository::{CallbackLogStore, DbResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

const COLUMNS: &str = "id, transaction_id, client_id, event, url, payload, attempt, http_status, \
     response_body, is_delivered, next_retry_at, delivered_at, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct CallbackLogRow {
    id: i64,
    transaction_id: String,
    client_id: i64,
    event: String,
    url: String,
    payload: String,
    attempt: i32,
    http_status: Option<i32>,
    response_body: Option<String>,
    is_delivered: bool,
    next_retry_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CallbackLogRow> for CallbackLog {
    type Error = DatabaseError;

    fn try_from(row: CallbackLogRow) -> Result<Self, Self::Error> {
        let event = CallbackEvent::from_db(&row.event).ok_or_else(|| {
            DatabaseError::new(DatabaseErrorKind::Unknown {
                message: format!("invalid callback event '{}'", row.event),
            })
        })?;
        Ok(CallbackLog {
            id: row.id,
            transaction_id: row.transaction_id,
            client_id: row.client_id,
            event,
            url: row.url,
            payload: row.payload,
            attempt: row.attempt,
            http_status: row.http_status,
            response_body: row.response_body,
            is_delivered: row.is_delivered,
            next_retry_at: row.next_retry_at,
            delivered_at: row.delivered_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct CallbackLogRepository {
    pool: PgPool,
}

impl CallbackLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallbackLogStore for CallbackLogRepository {
    async fn insert(&self, log: NewCallbackLog) -> DbResult<Option<CallbackLog>> {
        let sql = format!(
            "INSERT INTO callback_logs
             (transaction_id, client_id, event, url, payload, attempt, is_delivered, next_retry_at)
             VALUES ($1, $2, $3, $4, $5, 1, FALSE, $6)
             ON CONFLICT (transaction_id, event) DO NOTHING
             RETURNING {}",
            COLUMNS
        );
        sqlx::query_as::<_, CallbackLogRow>(&sql)
            .bind(&log.transaction_id)
            .bind(log.client_id)
            .bind(log.event.as_str())
            .bind(&log.url)
            .bind(&log.payload)
            .bind(log.next_retry_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(CallbackLog::try_from)
            .transpose()
    }

    async fn record_attempt(&self, id: i64, attempt: CallbackAttempt) -> DbResult<CallbackLog> {
        let sql = format!(
            "UPDATE callback_logs SET
                attempt = $2,
                http_status = $3,
                response_body = $4,
                is_delivered = $5,
                next_retry_at = $6,
                delivered_at = CASE WHEN $5 THEN $7 ELSE delivered_at END,
                updated_at = $7
             WHERE id = $1
             RETURNING {}",
            COLUMNS
        );
        let row = sqlx::query_as::<_, CallbackLogRow>(&sql)
            .bind(id)
            .bind(attempt.attempt)
            .bind(attempt.http_status)
            .bind(&attempt.response_body)
            .bind(attempt.delivered)
            .bind(attempt.next_retry_at)
            .bind(attempt.at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .ok_or_else(|| DatabaseError::not_found("callback_log", id))?;
        row.try_into()
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<CallbackLog>> {
        let sql = format!(
            "UPDATE callback_logs SET next_retry_at = $2
             WHERE id IN (
                 SELECT id FROM callback_logs
                 WHERE is_delivered = FALSE AND next_retry_at <= $1
                 ORDER BY next_retry_at, id
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            COLUMNS
        );
        sqlx::query_as::<_, CallbackLogRow>(&sql)
            .bind(now)
            .bind(claimed_until)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(CallbackLog::try_from)
            .collect()
    }

    async fn list_for_transaction(&self, transaction_id: &str) -> DbResult<Vec<CallbackLog>> {
        let sql = format!(
            "SELECT {} FROM callback_logs WHERE transaction_id = $1 ORDER BY id",
            COLUMNS
        );
        sqlx::query_as::<_, CallbackLogRow>(&sql)
            .bind(transaction_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(CallbackLog::try_from)
            .collect()
    }
}
