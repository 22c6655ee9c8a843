//! Storage seams used by the engine, the callback service and the workers.
//!
//! Every trait has a Postgres implementation (feature `database`) and the
//! in-memory implementation in [`crate::database::memory`].

use crate::database::error::DatabaseError;
use crate::database::models::{
    CallbackAttempt, CallbackLog, Client, NewCallbackLog, NewProviderCallback, NewTransaction,
    Product, ProviderCallback, ProviderSku, Sku, Transaction, TransactionUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

pub type DbResult<T> = Result<T, DatabaseError>;

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts a `Processing` row. Fails with `UniqueViolation` when the
    /// `(client_id, reference_id)` pair or the `transaction_id` is taken.
    async fn insert(&self, tx: NewTransaction) -> DbResult<Transaction>;

    async fn find_by_id(&self, id: i64) -> DbResult<Option<Transaction>>;

    async fn find_by_transaction_id(&self, transaction_id: &str) -> DbResult<Option<Transaction>>;

    async fn find_by_reference(
        &self,
        client_id: i64,
        reference_id: &str,
    ) -> DbResult<Option<Transaction>>;

    async fn find_by_provider_ref(
        &self,
        provider_code: &str,
        provider_ref_id: &str,
    ) -> DbResult<Option<Transaction>>;

    /// Atomically increments and returns the counter for `(prefix, date)`.
    async fn next_daily_sequence(&self, prefix: &str, date: NaiveDate) -> DbResult<i64>;

    /// Writes `update` only while the row is still non-terminal. Returns
    /// `None` when the row already reached `Success` or `Failed`.
    async fn apply_update(
        &self,
        id: i64,
        update: TransactionUpdate,
    ) -> DbResult<Option<Transaction>>;

    async fn mark_callback_sent(&self, id: i64, at: DateTime<Utc>) -> DbResult<()>;

    /// Claims `Pending` rows whose `next_retry_at` is due, plus non-terminal
    /// rows past `expired_at`.
    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Transaction>>;

    /// Claims `Processing` rows last touched before `stale_before`.
    async fn claim_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Transaction>>;

    async fn release_claim(&self, id: i64) -> DbResult<()>;
}

#[async_trait]
pub trait CallbackLogStore: Send + Sync {
    /// Returns `None` when a log for `(transaction_id, event)` already exists.
    async fn insert(&self, log: NewCallbackLog) -> DbResult<Option<CallbackLog>>;

    async fn record_attempt(&self, id: i64, attempt: CallbackAttempt) -> DbResult<CallbackLog>;

    /// Claims undelivered logs whose `next_retry_at` is due, pushing their
    /// `next_retry_at` to `claimed_until` so other sweepers skip them.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<CallbackLog>>;

    async fn list_for_transaction(&self, transaction_id: &str) -> DbResult<Vec<CallbackLog>>;
}

#[async_trait]
pub trait ProviderCallbackStore: Send + Sync {
    async fn insert(&self, callback: NewProviderCallback) -> DbResult<ProviderCallback>;

    async fn claim_unprocessed(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<ProviderCallback>>;

    async fn mark_processed(&self, id: i64, error: Option<String>) -> DbResult<()>;
}

/// Read-only catalog lookups. Catalog maintenance lives outside the gateway.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_product(&self, id: i64) -> DbResult<Option<Product>>;

    async fn find_product_by_code(&self, code: &str) -> DbResult<Option<Product>>;

    /// Active provider mappings for a product, unordered.
    async fn provider_skus(&self, product_id: i64) -> DbResult<Vec<ProviderSku>>;

    /// Legacy SKUs for a product, unordered and unfiltered.
    async fn skus(&self, product_id: i64) -> DbResult<Vec<Sku>>;

    async fn find_client(&self, id: i64) -> DbResult<Option<Client>>;
}
