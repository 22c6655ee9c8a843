//! Provider-pushed callbacks: verified and stored on receipt, applied later
//! by the callback sweep.

use crate::database::error::DatabaseError;
use crate::database::models::{NewProviderCallback, ProviderCallback, Transaction};
use crate::database::repository::{ProviderCallbackStore, TransactionStore};
use crate::payments::error::ProviderError;
use crate::payments::rc::Outcome;
use crate::payments::types::ProviderResponse;
use crate::services::provider_router::ProviderRouter;
use crate::services::reference::base_transaction_id;
use crate::services::transaction_engine::{to_chrono, EngineError, TransactionEngine};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("invalid callback signature: {0}")]
    InvalidSignature(String),
    #[error(transparent)]
    Parse(#[from] ProviderError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// What the sweep did with one stored callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackDisposition {
    Applied,
    /// The transaction was already settled, or the callback was for a token
    /// that no longer owns the transaction and did not report success.
    Ignored,
    Unresolved(String),
}

pub struct ProviderCallbackService {
    router: Arc<ProviderRouter>,
    callbacks: Arc<dyn ProviderCallbackStore>,
    transactions: Arc<dyn TransactionStore>,
    engine: Arc<TransactionEngine>,
    claim_lease: Duration,
}

impl ProviderCallbackService {
    pub fn new(
        router: Arc<ProviderRouter>,
        callbacks: Arc<dyn ProviderCallbackStore>,
        transactions: Arc<dyn TransactionStore>,
        engine: Arc<TransactionEngine>,
        claim_lease: Duration,
    ) -> Self {
        Self {
            router,
            callbacks,
            transactions,
            engine,
            claim_lease,
        }
    }

    /// Header the provider signs its callbacks in, if any.
    pub fn signature_header(&self, provider_code: &str) -> Option<&'static str> {
        self.router
            .adapter(provider_code)
            .and_then(|a| a.callback_signature_header())
    }

    /// Verifies and normalizes a raw callback, then stores it unprocessed.
    pub async fn ingest(
        &self,
        provider_code: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<ProviderCallback, IngestError> {
        let adapter = self
            .router
            .adapter(provider_code)
            .ok_or_else(|| IngestError::UnknownProvider(provider_code.to_string()))?;

        let verification = adapter.verify_callback(body, signature);
        if !verification.valid {
            return Err(IngestError::InvalidSignature(
                verification
                    .reason
                    .unwrap_or_else(|| "rejected".to_string()),
            ));
        }

        let parsed = adapter.parse_callback(body)?;
        let payload = serde_json::from_slice(body).unwrap_or(serde_json::Value::Null);
        let stored = self
            .callbacks
            .insert(NewProviderCallback {
                provider_code: provider_code.to_string(),
                ref_id: parsed.ref_id,
                rc: parsed.rc,
                status: parsed.status,
                message: parsed.message,
                serial_number: parsed.serial_number,
                price: parsed.price,
                payload,
            })
            .await?;

        info!(
            provider = %stored.provider_code,
            ref_id = %stored.ref_id,
            rc = ?stored.rc,
            callback_id = stored.id,
            "provider callback stored"
        );
        Ok(stored)
    }

    pub async fn claim_due(&self, limit: i64) -> Result<Vec<ProviderCallback>, DatabaseError> {
        let now = Utc::now();
        self.callbacks
            .claim_unprocessed(now, now + to_chrono(self.claim_lease), limit)
            .await
    }

    /// Applies one stored callback and marks it processed. Errors leave the
    /// callback unprocessed for the next sweep.
    pub async fn process(
        &self,
        callback: &ProviderCallback,
    ) -> Result<CallbackDisposition, EngineError> {
        let disposition = self.apply(callback).await?;
        let error = match &disposition {
            CallbackDisposition::Unresolved(reason) => Some(reason.clone()),
            _ => None,
        };
        self.callbacks.mark_processed(callback.id, error).await?;
        Ok(disposition)
    }

    async fn apply(&self, callback: &ProviderCallback) -> Result<CallbackDisposition, EngineError> {
        let Some(adapter) = self.router.adapter(&callback.provider_code) else {
            return Ok(CallbackDisposition::Unresolved(format!(
                "no adapter for provider {}",
                callback.provider_code
            )));
        };

        let Some(tx) = self.resolve(callback).await? else {
            warn!(
                provider = %callback.provider_code,
                ref_id = %callback.ref_id,
                "provider callback matches no transaction"
            );
            return Ok(CallbackDisposition::Unresolved(
                "transaction not found".to_string(),
            ));
        };

        if tx.status.is_terminal() {
            debug!(
                transaction_id = %tx.transaction_id,
                status = %tx.status,
                "callback for settled transaction ignored"
            );
            return Ok(CallbackDisposition::Ignored);
        }

        let outcome = match callback.rc.as_deref() {
            Some(rc) => adapter.classify(rc),
            None => classify_status(callback.status.as_deref()),
        };

        // Only the provider holding the current token may fail or park the
        // transaction. A superseded token can still report a delivered product.
        let current = tx.provider_code.as_deref() == Some(callback.provider_code.as_str())
            && tx.provider_ref_id.as_deref() == Some(callback.ref_id.as_str());
        if !current && outcome != Outcome::Success {
            debug!(
                transaction_id = %tx.transaction_id,
                ref_id = %callback.ref_id,
                provider = %callback.provider_code,
                owner = ?tx.provider_code,
                outcome = %outcome,
                "callback for superseded token ignored"
            );
            return Ok(CallbackDisposition::Ignored);
        }

        let response = ProviderResponse {
            ref_id: callback.ref_id.clone(),
            rc: callback.rc.clone().unwrap_or_default(),
            status: callback.status.clone(),
            message: callback.message.clone(),
            serial_number: callback.serial_number.clone(),
            price: callback.price,
            raw: Some(callback.payload.clone()),
            ..Default::default()
        };
        self.engine
            .apply_provider_result(&tx, outcome, &response)
            .await?;
        Ok(CallbackDisposition::Applied)
    }

    /// By provider reference first, then the id itself, then the id with any
    /// retry suffix stripped.
    async fn resolve(&self, callback: &ProviderCallback) -> Result<Option<Transaction>, EngineError> {
        if let Some(tx) = self
            .transactions
            .find_by_provider_ref(&callback.provider_code, &callback.ref_id)
            .await?
        {
            return Ok(Some(tx));
        }
        if let Some(tx) = self
            .transactions
            .find_by_transaction_id(&callback.ref_id)
            .await?
        {
            return Ok(Some(tx));
        }
        let base = base_transaction_id(&callback.ref_id);
        if base == callback.ref_id {
            return Ok(None);
        }
        Ok(self.transactions.find_by_transaction_id(base).await?)
    }
}

/// Providers that omit an rc still send a textual status.
fn classify_status(status: Option<&str>) -> Outcome {
    match status.map(|s| s.trim().to_lowercase()).as_deref() {
        Some("sukses") | Some("success") => Outcome::Success,
        Some("pending") => Outcome::Pending,
        _ => Outcome::Fatal,
    }
}
