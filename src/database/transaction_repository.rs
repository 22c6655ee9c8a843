use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::models::{NewTransaction, Transaction, TransactionStatus, TransactionUpdate};
use crate::database::repository::{DbResult, TransactionStore};
use crate::payments::types::TransactionType;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};

const COLUMNS: &str = "id, transaction_id, client_id, reference_id, type, status, product_id, \
     product_code, customer_no, sku_id, provider_id, provider_code, provider_sku_code, \
     provider_ref_id, ref_sequence, is_sandbox, inquiry_id, serial_number, customer_name, \
     amount, admin, buy_price, sell_price, failed_reason, failed_code, retry_count, \
     next_retry_at, expired_at, metadata, created_at, updated_at, processed_at, \
     callback_sent, callback_sent_at, claimed_until";

/// Raw `transactions` row; `type` and `status` are stored as text.
#[derive(Debug, Clone, FromRow)]
struct TransactionRow {
    id: i64,
    transaction_id: String,
    client_id: i64,
    reference_id: String,
    r#type: String,
    status: String,
    product_id: i64,
    product_code: String,
    customer_no: String,
    sku_id: Option<i64>,
    provider_id: Option<i64>,
    provider_code: Option<String>,
    provider_sku_code: Option<String>,
    provider_ref_id: Option<String>,
    ref_sequence: i32,
    is_sandbox: bool,
    inquiry_id: Option<String>,
    serial_number: Option<String>,
    customer_name: Option<String>,
    amount: i64,
    admin: i64,
    buy_price: i64,
    sell_price: i64,
    failed_reason: Option<String>,
    failed_code: Option<String>,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    callback_sent: bool,
    callback_sent_at: Option<DateTime<Utc>>,
    claimed_until: Option<DateTime<Utc>>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = DatabaseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let status = TransactionStatus::from_db_status(&row.status).ok_or_else(|| {
            DatabaseError::new(DatabaseErrorKind::Unknown {
                message: format!("invalid transaction status '{}'", row.status),
            })
        })?;
        let r#type = row.r#type.parse::<TransactionType>().map_err(|_| {
            DatabaseError::new(DatabaseErrorKind::Unknown {
                message: format!("invalid transaction type '{}'", row.r#type),
            })
        })?;

        Ok(Transaction {
            id: row.id,
            transaction_id: row.transaction_id,
            client_id: row.client_id,
            reference_id: row.reference_id,
            r#type,
            status,
            product_id: row.product_id,
            product_code: row.product_code,
            customer_no: row.customer_no,
            sku_id: row.sku_id,
            provider_id: row.provider_id,
            provider_code: row.provider_code,
            provider_sku_code: row.provider_sku_code,
            provider_ref_id: row.provider_ref_id,
            ref_sequence: row.ref_sequence,
            is_sandbox: row.is_sandbox,
            inquiry_id: row.inquiry_id,
            serial_number: row.serial_number,
            customer_name: row.customer_name,
            amount: row.amount,
            admin: row.admin,
            buy_price: row.buy_price,
            sell_price: row.sell_price,
            failed_reason: row.failed_reason,
            failed_code: row.failed_code,
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at,
            expired_at: row.expired_at,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
            callback_sent: row.callback_sent,
            callback_sent_at: row.callback_sent_at,
            claimed_until: row.claimed_until,
        })
    }
}

fn convert_all(rows: Vec<TransactionRow>) -> DbResult<Vec<Transaction>> {
    rows.into_iter().map(Transaction::try_from).collect()
}

/// Postgres-backed [`TransactionStore`].
pub struct TransactionRepository {
    pool: PgPool,
}

impl TransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_optional(&self, sql: &str, bind: &str) -> DbResult<Option<Transaction>> {
        sqlx::query_as::<_, TransactionRow>(sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Transaction::try_from)
            .transpose()
    }
}

#[async_trait]
impl TransactionStore for TransactionRepository {
    async fn insert(&self, tx: NewTransaction) -> DbResult<Transaction> {
        let sql = format!(
            "INSERT INTO transactions
             (transaction_id, client_id, reference_id, type, status, product_id, product_code,
              customer_no, sku_id, provider_id, provider_code, provider_sku_code, provider_ref_id,
              is_sandbox, inquiry_id, customer_name, amount, admin, buy_price, sell_price,
              metadata, created_at, updated_at, expired_at)
             VALUES ($1, $2, $3, $4, 'processing', $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                     $15, $16, $17, $18, $19, $20, $21, $21, $22)
             RETURNING {}",
            COLUMNS
        );
        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(&tx.transaction_id)
            .bind(tx.client_id)
            .bind(&tx.reference_id)
            .bind(tx.r#type.as_str())
            .bind(tx.product_id)
            .bind(&tx.product_code)
            .bind(&tx.customer_no)
            .bind(tx.sku_id)
            .bind(tx.provider_id)
            .bind(&tx.provider_code)
            .bind(&tx.provider_sku_code)
            .bind(&tx.provider_ref_id)
            .bind(tx.is_sandbox)
            .bind(&tx.inquiry_id)
            .bind(&tx.customer_name)
            .bind(tx.amount)
            .bind(tx.admin)
            .bind(tx.buy_price)
            .bind(tx.sell_price)
            .bind(&tx.metadata)
            .bind(tx.created_at)
            .bind(tx.expired_at)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        row.try_into()
    }

    async fn find_by_id(&self, id: i64) -> DbResult<Option<Transaction>> {
        let sql = format!("SELECT {} FROM transactions WHERE id = $1", COLUMNS);
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn find_by_transaction_id(&self, transaction_id: &str) -> DbResult<Option<Transaction>> {
        let sql = format!("SELECT {} FROM transactions WHERE transaction_id = $1", COLUMNS);
        self.fetch_optional(&sql, transaction_id).await
    }

    async fn find_by_reference(
        &self,
        client_id: i64,
        reference_id: &str,
    ) -> DbResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE client_id = $1 AND reference_id = $2",
            COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(client_id)
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn find_by_provider_ref(
        &self,
        provider_code: &str,
        provider_ref_id: &str,
    ) -> DbResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions
             WHERE provider_code = $1 AND provider_ref_id = $2
             ORDER BY id DESC LIMIT 1",
            COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(provider_code)
            .bind(provider_ref_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn next_daily_sequence(&self, prefix: &str, date: NaiveDate) -> DbResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO transaction_sequences (prefix, seq_date, last_value)
             VALUES ($1, $2, 1)
             ON CONFLICT (prefix, seq_date)
             DO UPDATE SET last_value = transaction_sequences.last_value + 1
             RETURNING last_value",
        )
        .bind(prefix)
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn apply_update(
        &self,
        id: i64,
        update: TransactionUpdate,
    ) -> DbResult<Option<Transaction>> {
        let sql = format!(
            "UPDATE transactions SET
                status = $2,
                sku_id = COALESCE($3, sku_id),
                provider_id = COALESCE($4, provider_id),
                provider_code = COALESCE($5, provider_code),
                provider_sku_code = COALESCE($6, provider_sku_code),
                provider_ref_id = COALESCE($7, provider_ref_id),
                ref_sequence = COALESCE($8, ref_sequence),
                serial_number = COALESCE($9, serial_number),
                customer_name = COALESCE($10, customer_name),
                amount = COALESCE($11, amount),
                admin = COALESCE($12, admin),
                buy_price = COALESCE($13, buy_price),
                failed_reason = COALESCE($14, failed_reason),
                failed_code = COALESCE($15, failed_code),
                retry_count = retry_count + $16,
                next_retry_at = $17,
                processed_at = COALESCE($18, processed_at),
                metadata = metadata || COALESCE($19, '{{}}'::jsonb),
                updated_at = NOW(),
                claimed_until = NULL
             WHERE id = $1 AND status IN ('processing', 'pending')
             RETURNING {}",
            COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .bind(update.status.as_str())
            .bind(update.sku_id)
            .bind(update.provider_id)
            .bind(&update.provider_code)
            .bind(&update.provider_sku_code)
            .bind(&update.provider_ref_id)
            .bind(update.ref_sequence)
            .bind(&update.serial_number)
            .bind(&update.customer_name)
            .bind(update.amount)
            .bind(update.admin)
            .bind(update.buy_price)
            .bind(&update.failed_reason)
            .bind(&update.failed_code)
            .bind(update.retry_increment)
            .bind(update.next_retry_at)
            .bind(update.processed_at)
            .bind(&update.metadata)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn mark_callback_sent(&self, id: i64, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            "UPDATE transactions SET callback_sent = TRUE, callback_sent_at = $2
             WHERE id = $1 AND callback_sent = FALSE",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Transaction>> {
        let sql = format!(
            "UPDATE transactions SET claimed_until = $2
             WHERE id IN (
                 SELECT id FROM transactions
                 WHERE status IN ('processing', 'pending')
                   AND (claimed_until IS NULL OR claimed_until <= $1)
                   AND ((status = 'pending' AND next_retry_at <= $1) OR expired_at <= $1)
                 ORDER BY next_retry_at NULLS FIRST, id
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(now)
            .bind(claimed_until)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        convert_all(rows)
    }

    async fn claim_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Transaction>> {
        let sql = format!(
            "UPDATE transactions SET claimed_until = $3
             WHERE id IN (
                 SELECT id FROM transactions
                 WHERE (status = 'processing'
                        OR (status = 'pending' AND next_retry_at IS NULL))
                   AND updated_at < $1
                   AND (claimed_until IS NULL OR claimed_until <= $2)
                 ORDER BY updated_at, id
                 LIMIT $4
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(stale_before)
            .bind(now)
            .bind(claimed_until)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        convert_all(rows)
    }

    async fn release_claim(&self, id: i64) -> DbResult<()> {
        sqlx::query("UPDATE transactions SET claimed_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
