//! In-memory stores with the same claiming and uniqueness rules as the
//! Postgres schema. Used by `SKIP_EXTERNALS=true` runs and by the tests.

use crate::database::error::DatabaseError;
use crate::database::models::{
    CallbackAttempt, CallbackLog, Client, NewCallbackLog, NewProviderCallback, NewTransaction,
    Product, ProviderCallback, ProviderSku, Sku, Transaction, TransactionStatus,
    TransactionUpdate,
};
use crate::database::repository::{
    CallbackLogStore, CatalogStore, DbResult, ProviderCallbackStore, TransactionStore,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    next_id: i64,
    transactions: Vec<Transaction>,
    sequences: HashMap<(String, NaiveDate), i64>,
    callback_logs: Vec<CallbackLog>,
    provider_callbacks: Vec<ProviderCallback>,
    provider_callback_claims: HashMap<i64, DateTime<Utc>>,
    products: Vec<Product>,
    provider_skus: Vec<ProviderSku>,
    skus: Vec<Sku>,
    clients: Vec<Client>,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

fn claim_free(tx: &Transaction, now: DateTime<Utc>) -> bool {
    tx.claimed_until.map(|until| until <= now).unwrap_or(true)
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Catalog seeding
    // ------------------------------------------------------------------------

    pub async fn add_product(&self, mut product: Product) -> Product {
        let mut state = self.state.lock().await;
        if product.id == 0 {
            product.id = state.id();
        }
        state.products.push(product.clone());
        product
    }

    pub async fn add_provider_sku(&self, mut sku: ProviderSku) -> ProviderSku {
        let mut state = self.state.lock().await;
        if sku.id == 0 {
            sku.id = state.id();
        }
        state.provider_skus.push(sku.clone());
        sku
    }

    pub async fn add_sku(&self, mut sku: Sku) -> Sku {
        let mut state = self.state.lock().await;
        if sku.id == 0 {
            sku.id = state.id();
        }
        state.skus.push(sku.clone());
        sku
    }

    pub async fn add_client(&self, mut client: Client) -> Client {
        let mut state = self.state.lock().await;
        if client.id == 0 {
            client.id = state.id();
        }
        state.clients.push(client.clone());
        client
    }

    /// Test hook for aging rows without waiting on the clock.
    pub async fn set_updated_at(&self, id: i64, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.transactions.iter_mut().find(|t| t.id == id) {
            tx.updated_at = at;
        }
    }

    /// Test hook for pulling undelivered webhooks forward to `at`.
    pub async fn set_callback_retry_at(&self, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        for log in state.callback_logs.iter_mut().filter(|l| !l.is_delivered) {
            if log.next_retry_at.is_some() {
                log.next_retry_at = Some(at);
            }
        }
    }

    pub async fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().await.transactions.clone()
    }

    pub async fn callback_logs(&self) -> Vec<CallbackLog> {
        self.state.lock().await.callback_logs.clone()
    }

    pub async fn provider_callbacks(&self) -> Vec<ProviderCallback> {
        self.state.lock().await.provider_callbacks.clone()
    }
}

// ============================================================================
// Transactions
// ============================================================================

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn insert(&self, new: NewTransaction) -> DbResult<Transaction> {
        let mut state = self.state.lock().await;
        if state
            .transactions
            .iter()
            .any(|t| t.client_id == new.client_id && t.reference_id == new.reference_id)
        {
            return Err(DatabaseError::unique_violation(
                "transactions_client_id_reference_id_key",
            ));
        }
        if state
            .transactions
            .iter()
            .any(|t| t.transaction_id == new.transaction_id)
        {
            return Err(DatabaseError::unique_violation("transactions_transaction_id_key"));
        }

        let id = state.id();
        let tx = Transaction {
            id,
            transaction_id: new.transaction_id,
            client_id: new.client_id,
            reference_id: new.reference_id,
            r#type: new.r#type,
            status: TransactionStatus::Processing,
            product_id: new.product_id,
            product_code: new.product_code,
            customer_no: new.customer_no,
            sku_id: new.sku_id,
            provider_id: new.provider_id,
            provider_code: new.provider_code,
            provider_sku_code: new.provider_sku_code,
            provider_ref_id: new.provider_ref_id,
            ref_sequence: 0,
            is_sandbox: new.is_sandbox,
            inquiry_id: new.inquiry_id,
            serial_number: None,
            customer_name: new.customer_name,
            amount: new.amount,
            admin: new.admin,
            buy_price: new.buy_price,
            sell_price: new.sell_price,
            failed_reason: None,
            failed_code: None,
            retry_count: 0,
            next_retry_at: None,
            expired_at: new.expired_at,
            metadata: new.metadata,
            created_at: new.created_at,
            updated_at: new.created_at,
            processed_at: None,
            callback_sent: false,
            callback_sent_at: None,
            claimed_until: None,
        };
        state.transactions.push(tx.clone());
        Ok(tx)
    }

    async fn find_by_id(&self, id: i64) -> DbResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn find_by_transaction_id(&self, transaction_id: &str) -> DbResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .find(|t| t.transaction_id == transaction_id)
            .cloned())
    }

    async fn find_by_reference(
        &self,
        client_id: i64,
        reference_id: &str,
    ) -> DbResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .find(|t| t.client_id == client_id && t.reference_id == reference_id)
            .cloned())
    }

    async fn find_by_provider_ref(
        &self,
        provider_code: &str,
        provider_ref_id: &str,
    ) -> DbResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .find(|t| {
                t.provider_code.as_deref() == Some(provider_code)
                    && t.provider_ref_id.as_deref() == Some(provider_ref_id)
            })
            .cloned())
    }

    async fn next_daily_sequence(&self, prefix: &str, date: NaiveDate) -> DbResult<i64> {
        let mut state = self.state.lock().await;
        let counter = state
            .sequences
            .entry((prefix.to_string(), date))
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn apply_update(
        &self,
        id: i64,
        update: TransactionUpdate,
    ) -> DbResult<Option<Transaction>> {
        let mut state = self.state.lock().await;
        let tx = state
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| DatabaseError::not_found("transaction", id))?;
        if tx.status.is_terminal() {
            return Ok(None);
        }
        update.apply_to(tx, Utc::now());
        Ok(Some(tx.clone()))
    }

    async fn mark_callback_sent(&self, id: i64, at: DateTime<Utc>) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.transactions.iter_mut().find(|t| t.id == id) {
            if !tx.callback_sent {
                tx.callback_sent = true;
                tx.callback_sent_at = Some(at);
            }
        }
        Ok(())
    }

    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Transaction>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<&mut Transaction> = state
            .transactions
            .iter_mut()
            .filter(|t| {
                !t.status.is_terminal()
                    && claim_free(t, now)
                    && ((t.status == TransactionStatus::Pending
                        && t.next_retry_at.map(|at| at <= now).unwrap_or(false))
                        || t.expired_at.map(|at| at <= now).unwrap_or(false))
            })
            .collect();
        due.sort_by_key(|t| (t.next_retry_at, t.id));

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|t| {
                t.claimed_until = Some(claimed_until);
                t.clone()
            })
            .collect())
    }

    async fn claim_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Transaction>> {
        let mut state = self.state.lock().await;
        let mut stale: Vec<&mut Transaction> = state
            .transactions
            .iter_mut()
            .filter(|t| {
                let awaiting_provider = t.status == TransactionStatus::Processing
                    || (t.status == TransactionStatus::Pending && t.next_retry_at.is_none());
                awaiting_provider && t.updated_at < stale_before && claim_free(t, now)
            })
            .collect();
        stale.sort_by_key(|t| (t.updated_at, t.id));

        Ok(stale
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|t| {
                t.claimed_until = Some(claimed_until);
                t.clone()
            })
            .collect())
    }

    async fn release_claim(&self, id: i64) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.transactions.iter_mut().find(|t| t.id == id) {
            tx.claimed_until = None;
        }
        Ok(())
    }
}

// ============================================================================
// Callback logs
// ============================================================================

#[async_trait]
impl CallbackLogStore for MemoryStore {
    async fn insert(&self, new: NewCallbackLog) -> DbResult<Option<CallbackLog>> {
        let mut state = self.state.lock().await;
        if state
            .callback_logs
            .iter()
            .any(|l| l.transaction_id == new.transaction_id && l.event == new.event)
        {
            return Ok(None);
        }
        let now = Utc::now();
        let log = CallbackLog {
            id: state.id(),
            transaction_id: new.transaction_id,
            client_id: new.client_id,
            event: new.event,
            url: new.url,
            payload: new.payload,
            attempt: 1,
            http_status: None,
            response_body: None,
            is_delivered: false,
            next_retry_at: new.next_retry_at,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        };
        state.callback_logs.push(log.clone());
        Ok(Some(log))
    }

    async fn record_attempt(&self, id: i64, attempt: CallbackAttempt) -> DbResult<CallbackLog> {
        let mut state = self.state.lock().await;
        let log = state
            .callback_logs
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| DatabaseError::not_found("callback_log", id))?;
        log.attempt = attempt.attempt;
        log.http_status = attempt.http_status;
        log.response_body = attempt.response_body;
        log.is_delivered = attempt.delivered;
        log.next_retry_at = attempt.next_retry_at;
        if attempt.delivered {
            log.delivered_at = Some(attempt.at);
        }
        log.updated_at = attempt.at;
        Ok(log.clone())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<CallbackLog>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<&mut CallbackLog> = state
            .callback_logs
            .iter_mut()
            .filter(|l| !l.is_delivered && l.next_retry_at.map(|at| at <= now).unwrap_or(false))
            .collect();
        due.sort_by_key(|l| (l.next_retry_at, l.id));

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|l| {
                l.next_retry_at = Some(claimed_until);
                l.clone()
            })
            .collect())
    }

    async fn list_for_transaction(&self, transaction_id: &str) -> DbResult<Vec<CallbackLog>> {
        let state = self.state.lock().await;
        Ok(state
            .callback_logs
            .iter()
            .filter(|l| l.transaction_id == transaction_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Provider callbacks
// ============================================================================

#[async_trait]
impl ProviderCallbackStore for MemoryStore {
    async fn insert(&self, new: NewProviderCallback) -> DbResult<ProviderCallback> {
        let mut state = self.state.lock().await;
        let callback = ProviderCallback {
            id: state.id(),
            provider_code: new.provider_code,
            ref_id: new.ref_id,
            rc: new.rc,
            status: new.status,
            message: new.message,
            serial_number: new.serial_number,
            price: new.price,
            payload: new.payload,
            is_processed: false,
            process_error: None,
            created_at: Utc::now(),
            processed_at: None,
        };
        state.provider_callbacks.push(callback.clone());
        Ok(callback)
    }

    async fn claim_unprocessed(
        &self,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<ProviderCallback>> {
        let mut state = self.state.lock().await;
        let State {
            provider_callbacks,
            provider_callback_claims,
            ..
        } = &mut *state;

        let mut claimed = Vec::new();
        for callback in provider_callbacks.iter().filter(|c| !c.is_processed) {
            if claimed.len() as i64 >= limit {
                break;
            }
            let free = provider_callback_claims
                .get(&callback.id)
                .map(|until| *until <= now)
                .unwrap_or(true);
            if free {
                provider_callback_claims.insert(callback.id, claimed_until);
                claimed.push(callback.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, id: i64, error: Option<String>) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let callback = state
            .provider_callbacks
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| DatabaseError::not_found("provider_callback", id))?;
        callback.is_processed = true;
        callback.process_error = error;
        callback.processed_at = Some(Utc::now());
        state.provider_callback_claims.remove(&id);
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn find_product(&self, id: i64) -> DbResult<Option<Product>> {
        let state = self.state.lock().await;
        Ok(state.products.iter().find(|p| p.id == id).cloned())
    }

    async fn find_product_by_code(&self, code: &str) -> DbResult<Option<Product>> {
        let state = self.state.lock().await;
        Ok(state.products.iter().find(|p| p.code == code).cloned())
    }

    async fn provider_skus(&self, product_id: i64) -> DbResult<Vec<ProviderSku>> {
        let state = self.state.lock().await;
        Ok(state
            .provider_skus
            .iter()
            .filter(|s| s.product_id == product_id && s.is_active)
            .cloned()
            .collect())
    }

    async fn skus(&self, product_id: i64) -> DbResult<Vec<Sku>> {
        let state = self.state.lock().await;
        Ok(state
            .skus
            .iter()
            .filter(|s| s.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn find_client(&self, id: i64) -> DbResult<Option<Client>> {
        let state = self.state.lock().await;
        Ok(state.clients.iter().find(|c| c.id == id).cloned())
    }
}
