//! Transaction state machine.
//!
//! The engine owns every write to a transaction row. Routing produces a
//! [`RouteReport`] and the engine turns it into exactly one
//! [`TransactionUpdate`]; the store only applies it while the row is still
//! non-terminal, so racing reconcilers converge instead of overwriting each
//! other.

use crate::cache::error::CacheError;
use crate::cache::inquiry::{end_of_business_day, CachedInquiry, InquiryCache};
use crate::cache::keys::inquiry::CompositeKey;
use crate::database::error::DatabaseError;
use crate::database::models::{
    CallbackEvent, NewTransaction, Product, Transaction, TransactionStatus, TransactionUpdate,
};
use crate::database::repository::{CatalogStore, TransactionStore};
use crate::database::Stores;
use crate::logging::mask_customer_no;
use crate::payments::rc::Outcome;
use crate::payments::types::{ProviderResponse, TransactionType};
use crate::services::callback::CallbackDispatcher;
use crate::services::provider_router::{
    AttemptResult, ProviderOption, ProviderRouter, RouteDecision, RouteReport,
};
use crate::services::reference::RefTokens;
use crate::services::transaction_id::{IdPrefixes, TransactionIdGenerator};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub prefixes: IdPrefixes,
    /// Horizon before an exhausted transaction is routed again.
    pub pending_retry: Duration,
    /// Lifetime after which an unresolved transaction is failed.
    pub max_age: Duration,
    pub business_utc_offset_hours: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefixes: IdPrefixes::default(),
            pending_retry: Duration::from_secs(15 * 60),
            max_age: Duration::from_secs(24 * 60 * 60),
            business_utc_offset_hours: 7,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            prefixes: IdPrefixes {
                prepaid: std::env::var("TRANSACTION_PREFIX").unwrap_or(defaults.prefixes.prepaid),
                inquiry: std::env::var("INQUIRY_PREFIX").unwrap_or(defaults.prefixes.inquiry),
                payment: std::env::var("PAYMENT_PREFIX").unwrap_or(defaults.prefixes.payment),
            },
            pending_retry: std::env::var("PENDING_RETRY_MINUTES")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(defaults.pending_retry),
            max_age: std::env::var("MAX_TRANSACTION_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|h| Duration::from_secs(h * 60 * 60))
                .unwrap_or(defaults.max_age),
            business_utc_offset_hours: std::env::var("BUSINESS_UTC_OFFSET_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.business_utc_offset_hours),
        }
    }

    /// Falls back to UTC for out-of-range offsets.
    pub fn business_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.business_utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("payment does not match inquiry {inquiry_id}: {field} differs")]
    InquiryMismatch {
        inquiry_id: String,
        field: &'static str,
    },

    #[error("inquiry {0} has expired")]
    InquiryExpired(String),

    #[error("product {0} is not available")]
    ProductUnavailable(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub type EngineResult<T> = Result<T, EngineError>;

// ============================================================================
// Requests and results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransactionRequest {
    pub client_id: i64,
    pub reference_id: String,
    pub product_code: String,
    pub customer_no: String,
    #[serde(default)]
    pub is_sandbox: bool,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InquiryRequest {
    pub client_id: i64,
    pub reference_id: String,
    pub product_code: String,
    pub customer_no: String,
    #[serde(default)]
    pub is_sandbox: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub client_id: i64,
    pub reference_id: String,
    pub product_code: String,
    pub customer_no: String,
    /// Looked up by the composite key when absent.
    #[serde(default)]
    pub inquiry_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

/// A transaction as returned to the client. `duplicate` is set when the
/// `(client, reference)` pair was already known.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub transaction: Transaction,
    pub duplicate: bool,
}

#[derive(Debug, Clone)]
pub enum InquiryOutcome {
    Ready(CachedInquiry),
    Rejected {
        rc: Option<String>,
        message: String,
        decision: RouteDecision,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drive {
    /// Synchronous attempt right after creation.
    Inline,
    /// A worker routing a parked transaction again.
    Redrive,
}

// ============================================================================
// Engine
// ============================================================================

pub struct TransactionEngine {
    transactions: Arc<dyn TransactionStore>,
    catalog: Arc<dyn CatalogStore>,
    router: Arc<ProviderRouter>,
    inquiries: Arc<dyn InquiryCache>,
    ids: TransactionIdGenerator,
    dispatcher: CallbackDispatcher,
    config: EngineConfig,
}

impl TransactionEngine {
    pub fn new(
        stores: &Stores,
        router: Arc<ProviderRouter>,
        inquiries: Arc<dyn InquiryCache>,
        dispatcher: CallbackDispatcher,
        config: EngineConfig,
    ) -> Self {
        let ids = TransactionIdGenerator::new(
            stores.transactions.clone(),
            config.prefixes.clone(),
            config.business_offset(),
        );
        Self {
            transactions: stores.transactions.clone(),
            catalog: stores.catalog.clone(),
            router,
            inquiries,
            ids,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    pub fn dispatcher(&self) -> &CallbackDispatcher {
        &self.dispatcher
    }

    // ------------------------------------------------------------------------
    // Prepaid
    // ------------------------------------------------------------------------

    /// Persists a `Processing` row and routes it synchronously.
    pub async fn create_transaction(
        &self,
        request: CreateTransactionRequest,
    ) -> EngineResult<Accepted> {
        validate_common(
            request.client_id,
            &request.reference_id,
            &request.product_code,
            &request.customer_no,
        )?;

        if let Some(existing) = self.find_duplicate(request.client_id, &request.reference_id).await? {
            return Ok(existing);
        }

        let product = self.routable_product(&request.product_code).await?;
        if product.is_postpaid {
            return Err(EngineError::Validation(format!(
                "product {} is postpaid, use inquiry and payment",
                product.code
            )));
        }

        let options = self
            .router
            .select_providers(product.id, TransactionType::Prepaid)
            .await?;
        if options.is_empty() {
            return Err(EngineError::ProductUnavailable(product.code));
        }

        let now = Utc::now();
        let transaction_id = self.ids.next(TransactionType::Prepaid, now).await?;
        let new_tx = NewTransaction {
            transaction_id: transaction_id.clone(),
            client_id: request.client_id,
            reference_id: request.reference_id.clone(),
            r#type: TransactionType::Prepaid,
            product_id: product.id,
            product_code: product.code.clone(),
            customer_no: request.customer_no.clone(),
            sku_id: None,
            provider_id: None,
            provider_code: None,
            provider_sku_code: None,
            provider_ref_id: None,
            is_sandbox: request.is_sandbox,
            inquiry_id: None,
            customer_name: None,
            amount: 0,
            admin: 0,
            buy_price: 0,
            sell_price: product.sell_price,
            metadata: request.metadata.clone().unwrap_or_else(|| json!({})),
            created_at: now,
            expired_at: Some(now + to_chrono(self.config.max_age)),
        };

        let tx = match self.insert_or_duplicate(new_tx).await? {
            Ok(tx) => tx,
            Err(duplicate) => return Ok(duplicate),
        };

        info!(
            transaction_id = %tx.transaction_id,
            client_id = tx.client_id,
            product = %tx.product_code,
            customer_no = %mask_customer_no(&tx.customer_no),
            "transaction accepted"
        );

        let report = self
            .router
            .execute_options(
                TransactionType::Prepaid,
                &tx.customer_no,
                tx.is_sandbox,
                &options,
                RefTokens::sequence(tx.transaction_id.clone(), 0),
            )
            .await;
        let transaction = self.apply_report(&tx, report, Drive::Inline).await?;

        Ok(Accepted {
            transaction,
            duplicate: false,
        })
    }

    // ------------------------------------------------------------------------
    // Postpaid
    // ------------------------------------------------------------------------

    /// Asks the upstream for the bill and caches it until the payment
    /// arrives. Inquiries never create a transaction row.
    pub async fn inquiry(&self, request: InquiryRequest) -> EngineResult<InquiryOutcome> {
        validate_common(
            request.client_id,
            &request.reference_id,
            &request.product_code,
            &request.customer_no,
        )?;

        let product = self.routable_product(&request.product_code).await?;
        if !product.is_postpaid {
            return Err(EngineError::Validation(format!(
                "product {} is prepaid, use a transaction",
                product.code
            )));
        }

        let key = CompositeKey::new(
            request.client_id,
            request.customer_no.clone(),
            product.code.clone(),
            request.reference_id.clone(),
        );
        let now = Utc::now();
        if let Some(cached) = self.inquiries.get_by_composite(&key).await? {
            if !cached.is_expired(now) {
                debug!(inquiry_id = %cached.transaction_id, "inquiry served from cache");
                return Ok(InquiryOutcome::Ready(cached));
            }
            self.inquiries.delete(&cached).await?;
        }

        let options = self
            .router
            .select_providers(product.id, TransactionType::Inquiry)
            .await?;
        if options.is_empty() {
            return Err(EngineError::ProductUnavailable(product.code));
        }

        let inquiry_id = self.ids.next(TransactionType::Inquiry, now).await?;
        let report = self
            .router
            .execute_options(
                TransactionType::Inquiry,
                &request.customer_no,
                request.is_sandbox,
                &options,
                RefTokens::sequence(inquiry_id.clone(), 0),
            )
            .await;

        let attempt = match (report.decision, report.last()) {
            (RouteDecision::Success, Some(attempt)) => attempt,
            (decision, last) => {
                let rc = last.and_then(|a| a.rc()).map(str::to_string);
                let message = last
                    .and_then(AttemptResult::message)
                    .unwrap_or_else(|| "no provider could answer the inquiry".to_string());
                info!(
                    inquiry_id = %inquiry_id,
                    decision = ?decision,
                    rc = ?rc,
                    "inquiry rejected"
                );
                return Ok(InquiryOutcome::Rejected {
                    rc,
                    message,
                    decision,
                });
            }
        };

        let response = attempt.response.clone().unwrap_or_default();
        let amount = response.amount.unwrap_or(0);
        let admin = response.admin.unwrap_or(attempt.option.admin);
        let inquiry = CachedInquiry {
            transaction_id: inquiry_id,
            client_id: request.client_id,
            reference_id: request.reference_id,
            customer_no: request.customer_no,
            customer_name: response.customer_name.clone(),
            product_id: product.id,
            product_code: product.code,
            provider_id: attempt.option.provider_id,
            provider_code: attempt.option.provider_code.clone(),
            provider_sku_code: attempt.option.sku_code.clone(),
            sku_id: attempt.option.sku_id,
            provider_ref_id: attempt.ref_id.clone(),
            amount,
            admin,
            buy_price: response.price.unwrap_or(amount + admin),
            sell_price: amount + product.admin_fee,
            is_sandbox: request.is_sandbox,
            created_at: now,
            expires_at: end_of_business_day(now, self.config.business_offset()),
        };
        self.inquiries.set(&inquiry).await?;

        info!(
            inquiry_id = %inquiry.transaction_id,
            provider = %inquiry.provider_code,
            customer_no = %mask_customer_no(&inquiry.customer_no),
            amount = inquiry.amount,
            "inquiry cached"
        );
        Ok(InquiryOutcome::Ready(inquiry))
    }

    /// Pays a cached inquiry through the provider that answered it, reusing
    /// the inquiry's reference token.
    pub async fn pay(&self, request: PaymentRequest) -> EngineResult<Accepted> {
        validate_common(
            request.client_id,
            &request.reference_id,
            &request.product_code,
            &request.customer_no,
        )?;

        if let Some(existing) = self.find_duplicate(request.client_id, &request.reference_id).await? {
            return Ok(existing);
        }

        let inquiry = self.matching_inquiry(&request).await?;
        let now = Utc::now();
        if inquiry.is_expired(now) {
            self.inquiries.delete(&inquiry).await?;
            return Err(EngineError::InquiryExpired(inquiry.transaction_id));
        }

        let transaction_id = self.ids.next(TransactionType::Payment, now).await?;
        let new_tx = NewTransaction {
            transaction_id,
            client_id: request.client_id,
            reference_id: request.reference_id.clone(),
            r#type: TransactionType::Payment,
            product_id: inquiry.product_id,
            product_code: inquiry.product_code.clone(),
            customer_no: inquiry.customer_no.clone(),
            sku_id: inquiry.sku_id,
            provider_id: inquiry.provider_id,
            provider_code: Some(inquiry.provider_code.clone()),
            provider_sku_code: Some(inquiry.provider_sku_code.clone()),
            provider_ref_id: Some(inquiry.provider_ref_id.clone()),
            is_sandbox: inquiry.is_sandbox,
            inquiry_id: Some(inquiry.transaction_id.clone()),
            customer_name: inquiry.customer_name.clone(),
            amount: inquiry.amount,
            admin: inquiry.admin,
            buy_price: inquiry.buy_price,
            sell_price: inquiry.sell_price,
            metadata: request.metadata.clone().unwrap_or_else(|| json!({})),
            created_at: now,
            expired_at: Some(now + to_chrono(self.config.max_age)),
        };

        let tx = match self.insert_or_duplicate(new_tx).await? {
            Ok(tx) => tx,
            Err(duplicate) => return Ok(duplicate),
        };

        info!(
            transaction_id = %tx.transaction_id,
            inquiry_id = %inquiry.transaction_id,
            provider = %inquiry.provider_code,
            "payment accepted"
        );

        let options = [pinned_option(&tx)];
        let report = self
            .router
            .execute_options(
                TransactionType::Payment,
                &tx.customer_no,
                tx.is_sandbox,
                &options,
                RefTokens::fixed(inquiry.provider_ref_id.clone()),
            )
            .await;
        let transaction = self.apply_report(&tx, report, Drive::Inline).await?;

        Ok(Accepted {
            transaction,
            duplicate: false,
        })
    }

    async fn matching_inquiry(&self, request: &PaymentRequest) -> EngineResult<CachedInquiry> {
        let found = match &request.inquiry_id {
            Some(id) => self.inquiries.get_by_transaction_id(id).await?,
            None => {
                let key = CompositeKey::new(
                    request.client_id,
                    request.customer_no.clone(),
                    request.product_code.clone(),
                    request.reference_id.clone(),
                );
                self.inquiries.get_by_composite(&key).await?
            }
        };

        let inquiry = found.ok_or_else(|| EngineError::NotFound {
            entity: "inquiry",
            id: request
                .inquiry_id
                .clone()
                .unwrap_or_else(|| request.reference_id.clone()),
        })?;

        let mismatch = if inquiry.client_id != request.client_id {
            Some("client_id")
        } else if inquiry.customer_no != request.customer_no {
            Some("customer_no")
        } else if inquiry.product_code != request.product_code {
            Some("product_code")
        } else if inquiry.reference_id != request.reference_id {
            Some("reference_id")
        } else {
            None
        };

        match mismatch {
            Some(field) => Err(EngineError::InquiryMismatch {
                inquiry_id: inquiry.transaction_id,
                field,
            }),
            None => Ok(inquiry),
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Transactions are only visible to the client that created them.
    pub async fn get_transaction(
        &self,
        client_id: i64,
        transaction_id: &str,
    ) -> EngineResult<Transaction> {
        self.transactions
            .find_by_transaction_id(transaction_id)
            .await?
            .filter(|tx| tx.client_id == client_id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "transaction",
                id: transaction_id.to_string(),
            })
    }

    // ------------------------------------------------------------------------
    // Reconciliation entry points
    // ------------------------------------------------------------------------

    /// Routes a parked transaction again. Suffixes continue from the
    /// persisted `ref_sequence`; payments stay pinned to their inquiry.
    pub async fn redrive(&self, tx: &Transaction) -> EngineResult<Transaction> {
        if tx.status.is_terminal() {
            return Ok(tx.clone());
        }

        let (options, tokens) = if let Some(token) = pinned_token(tx) {
            (vec![pinned_option(tx)], RefTokens::fixed(token))
        } else {
            let options = self
                .router
                .select_providers(tx.product_id, tx.r#type)
                .await?;
            (
                options,
                RefTokens::sequence(tx.transaction_id.clone(), tx.ref_sequence),
            )
        };

        debug!(
            transaction_id = %tx.transaction_id,
            retry_count = tx.retry_count,
            ref_sequence = tx.ref_sequence,
            options = options.len(),
            "re-driving transaction"
        );

        let report = self
            .router
            .execute_options(tx.r#type, &tx.customer_no, tx.is_sandbox, &options, tokens)
            .await;
        self.apply_report(tx, report, Drive::Redrive).await
    }

    /// Moves a non-terminal transaction to `Failed` without asking a provider.
    pub async fn force_fail(
        &self,
        tx: &Transaction,
        reason: &str,
        code: &str,
    ) -> EngineResult<Transaction> {
        let mut update = TransactionUpdate::status(TransactionStatus::Failed);
        update.failed_reason = Some(reason.to_string());
        update.failed_code = Some(code.to_string());
        update.processed_at = Some(Utc::now());
        self.transition(tx, update, Some(CallbackEvent::Failed)).await
    }

    /// Parks a transaction so the retry sweep routes it with a fresh suffix.
    pub async fn park_for_retry(&self, tx: &Transaction) -> EngineResult<Transaction> {
        let mut update = TransactionUpdate::status(TransactionStatus::Pending);
        update.next_retry_at = Some(Utc::now());
        self.transition(tx, update, None).await
    }

    /// Applies an answer that did not come from routing: a status check or a
    /// provider-pushed callback.
    pub async fn apply_provider_result(
        &self,
        tx: &Transaction,
        outcome: Outcome,
        response: &ProviderResponse,
    ) -> EngineResult<Transaction> {
        if tx.status.is_terminal() {
            debug!(transaction_id = %tx.transaction_id, status = %tx.status, "provider result for settled transaction ignored");
            return Ok(tx.clone());
        }

        match outcome {
            Outcome::Success => {
                let mut update = TransactionUpdate::status(TransactionStatus::Success);
                stamp_response(&mut update, response);
                update.processed_at = Some(Utc::now());
                update.metadata = Some(json!({ "last_rc": response.rc }));
                self.transition(tx, update, Some(CallbackEvent::Success)).await
            }
            Outcome::Fatal => {
                let mut update = TransactionUpdate::status(TransactionStatus::Failed);
                update.failed_reason = Some(
                    response
                        .message
                        .clone()
                        .unwrap_or_else(|| "provider rejected the transaction".to_string()),
                );
                update.failed_code = Some(response.rc.clone());
                update.processed_at = Some(Utc::now());
                update.metadata = Some(json!({ "last_rc": response.rc }));
                self.transition(tx, update, Some(CallbackEvent::Failed)).await
            }
            Outcome::Pending => {
                debug!(transaction_id = %tx.transaction_id, rc = %response.rc, "provider still pending");
                Ok(tx.clone())
            }
            Outcome::RetryableSwitch | Outcome::RetryableWait => {
                info!(
                    transaction_id = %tx.transaction_id,
                    rc = %response.rc,
                    outcome = %outcome,
                    "provider gave up, parking for retry"
                );
                self.park_for_retry(tx).await
            }
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn find_duplicate(
        &self,
        client_id: i64,
        reference_id: &str,
    ) -> EngineResult<Option<Accepted>> {
        Ok(self
            .transactions
            .find_by_reference(client_id, reference_id)
            .await?
            .map(|transaction| {
                debug!(
                    transaction_id = %transaction.transaction_id,
                    reference_id,
                    "duplicate reference, returning original"
                );
                Accepted {
                    transaction,
                    duplicate: true,
                }
            }))
    }

    /// A concurrent request for the same reference may win the insert; its
    /// row is then returned as the duplicate.
    async fn insert_or_duplicate(
        &self,
        new_tx: NewTransaction,
    ) -> EngineResult<Result<Transaction, Accepted>> {
        let client_id = new_tx.client_id;
        let reference_id = new_tx.reference_id.clone();
        match self.transactions.insert(new_tx).await {
            Ok(tx) => Ok(Ok(tx)),
            Err(e) if e.is_unique_violation() => {
                match self.find_duplicate(client_id, &reference_id).await? {
                    Some(existing) => Ok(Err(existing)),
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn routable_product(&self, code: &str) -> EngineResult<Product> {
        match self.catalog.find_product_by_code(code).await? {
            Some(product) if product.is_active => Ok(product),
            Some(product) => Err(EngineError::ProductUnavailable(product.code)),
            None => Err(EngineError::NotFound {
                entity: "product",
                id: code.to_string(),
            }),
        }
    }

    async fn apply_report(
        &self,
        tx: &Transaction,
        report: RouteReport,
        drive: Drive,
    ) -> EngineResult<Transaction> {
        let now = Utc::now();
        let last = report.last();

        let (mut update, event) = match report.decision {
            RouteDecision::Success => {
                let mut update = TransactionUpdate::status(TransactionStatus::Success);
                update.processed_at = Some(now);
                (update, Some(CallbackEvent::Success))
            }
            RouteDecision::Failed => {
                let mut update = TransactionUpdate::status(TransactionStatus::Failed);
                update.failed_reason = Some(
                    last.and_then(AttemptResult::message)
                        .unwrap_or_else(|| "provider rejected the transaction".to_string()),
                );
                update.failed_code =
                    Some(last.and_then(|a| a.rc()).unwrap_or("FAILED").to_string());
                update.processed_at = Some(now);
                (update, Some(CallbackEvent::Failed))
            }
            RouteDecision::Pending => {
                let status = if drive == Drive::Inline && tx.status == TransactionStatus::Processing
                {
                    TransactionStatus::Processing
                } else {
                    TransactionStatus::Pending
                };
                (TransactionUpdate::status(status), None)
            }
            RouteDecision::Exhausted => {
                let mut update = TransactionUpdate::status(TransactionStatus::Pending);
                update.retry_increment = 1;
                update.next_retry_at = Some(now + to_chrono(self.config.pending_retry));
                (update, Some(CallbackEvent::Pending))
            }
        };

        if let Some(attempt) = last {
            stamp_attempt(&mut update, attempt);
        }
        update.ref_sequence = Some(report.ref_sequence.max(tx.ref_sequence));
        update.metadata = Some(json!({
            "attempts": report.attempts.len(),
            "last_rc": last.and_then(|a| a.rc()),
            "decision": format!("{:?}", report.decision).to_lowercase(),
        }));

        self.transition(tx, update, event).await
    }

    async fn transition(
        &self,
        tx: &Transaction,
        update: TransactionUpdate,
        event: Option<CallbackEvent>,
    ) -> EngineResult<Transaction> {
        if !tx.status.can_transition_to(update.status) {
            warn!(
                transaction_id = %tx.transaction_id,
                from = %tx.status,
                to = %update.status,
                "transition not allowed, skipping"
            );
            return Ok(tx.clone());
        }

        let Some(updated) = self.transactions.apply_update(tx.id, update).await? else {
            debug!(transaction_id = %tx.transaction_id, "transaction already settled, update skipped");
            return Ok(self
                .transactions
                .find_by_id(tx.id)
                .await?
                .unwrap_or_else(|| tx.clone()));
        };

        info!(
            transaction_id = %updated.transaction_id,
            from = %tx.status,
            to = %updated.status,
            retry_count = updated.retry_count,
            "transaction state changed"
        );

        if updated.status == TransactionStatus::Success && updated.r#type == TransactionType::Payment
        {
            self.consume_inquiry(&updated).await;
        }
        if let Some(event) = event {
            self.dispatcher.dispatch(updated.clone(), event).await;
        }
        Ok(updated)
    }

    /// Inquiries are single-use once their payment settles.
    async fn consume_inquiry(&self, tx: &Transaction) {
        let Some(inquiry_id) = tx.inquiry_id.as_deref() else {
            return;
        };
        let result = match self.inquiries.get_by_transaction_id(inquiry_id).await {
            Ok(Some(inquiry)) => self.inquiries.delete(&inquiry).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(transaction_id = %tx.transaction_id, inquiry_id, error = %e, "failed to drop paid inquiry");
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn validate_common(
    client_id: i64,
    reference_id: &str,
    product_code: &str,
    customer_no: &str,
) -> EngineResult<()> {
    if client_id <= 0 {
        return Err(EngineError::Validation("client_id is required".to_string()));
    }
    if reference_id.trim().is_empty() || reference_id.len() > 64 {
        return Err(EngineError::Validation(
            "reference_id must be 1 to 64 characters".to_string(),
        ));
    }
    if product_code.trim().is_empty() {
        return Err(EngineError::Validation("product_code is required".to_string()));
    }
    if customer_no.is_empty()
        || customer_no.len() > 32
        || !customer_no.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(EngineError::Validation(
            "customer_no must be 1 to 32 alphanumeric characters".to_string(),
        ));
    }
    Ok(())
}

/// Payments reuse the inquiry's reference for every attempt.
fn pinned_token(tx: &Transaction) -> Option<String> {
    if tx.r#type == TransactionType::Payment {
        tx.provider_ref_id.clone()
    } else {
        None
    }
}

fn pinned_option(tx: &Transaction) -> ProviderOption {
    ProviderOption {
        provider_id: tx.provider_id,
        provider_code: tx.provider_code.clone().unwrap_or_default(),
        sku_id: tx.sku_id,
        sku_code: tx.provider_sku_code.clone().unwrap_or_default(),
        price: tx.buy_price,
        admin: tx.admin,
        commission: 0,
        is_backup: false,
        priority: 1,
    }
}

fn stamp_attempt(update: &mut TransactionUpdate, attempt: &AttemptResult) {
    update.provider_id = attempt.option.provider_id;
    update.provider_code = Some(attempt.option.provider_code.clone());
    update.provider_sku_code = Some(attempt.option.sku_code.clone());
    update.sku_id = attempt.option.sku_id;
    update.provider_ref_id = Some(attempt.ref_id.clone());
    update.buy_price = Some(attempt.option.price);
    if let Some(response) = &attempt.response {
        stamp_response(update, response);
    }
}

fn stamp_response(update: &mut TransactionUpdate, response: &ProviderResponse) {
    if response.serial_number.as_deref().is_some_and(|sn| !sn.is_empty()) {
        update.serial_number = response.serial_number.clone();
    }
    if response.customer_name.is_some() {
        update.customer_name = response.customer_name.clone();
    }
    if let Some(price) = response.price.filter(|p| *p > 0) {
        update.buy_price = Some(price);
    }
    if response.amount.is_some() {
        update.amount = response.amount;
    }
    if response.admin.is_some() {
        update.admin = response.admin;
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// `true` once `tx` has outlived `max_age`.
pub fn is_past_max_age(tx: &Transaction, max_age: Duration, now: DateTime<Utc>) -> bool {
    now - tx.created_at >= to_chrono(max_age)
}
