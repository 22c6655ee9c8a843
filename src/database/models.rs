//! Persisted entities of the gateway.

use crate::payments::types::TransactionType;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ============================================================================
// Transaction
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Processing,
    Pending,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Processing => "processing",
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status.to_lowercase().as_str() {
            "processing" => Some(TransactionStatus::Processing),
            "pending" => Some(TransactionStatus::Pending),
            "success" => Some(TransactionStatus::Success),
            "failed" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Failed)
    }

    /// Staying in a non-terminal state is allowed (bookkeeping updates).
    pub fn valid_transitions(&self) -> Vec<TransactionStatus> {
        match self {
            TransactionStatus::Processing => vec![
                TransactionStatus::Processing,
                TransactionStatus::Pending,
                TransactionStatus::Success,
                TransactionStatus::Failed,
            ],
            TransactionStatus::Pending => vec![
                TransactionStatus::Pending,
                TransactionStatus::Success,
                TransactionStatus::Failed,
            ],
            TransactionStatus::Success | TransactionStatus::Failed => vec![],
        }
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: i64,
    pub transaction_id: String,
    pub client_id: i64,
    pub reference_id: String,
    pub r#type: TransactionType,
    pub status: TransactionStatus,
    pub product_id: i64,
    pub product_code: String,
    pub customer_no: String,
    pub sku_id: Option<i64>,
    pub provider_id: Option<i64>,
    pub provider_code: Option<String>,
    pub provider_sku_code: Option<String>,
    pub provider_ref_id: Option<String>,
    /// Number of reference tokens already issued for this transaction.
    pub ref_sequence: i32,
    pub is_sandbox: bool,
    pub inquiry_id: Option<String>,
    pub serial_number: Option<String>,
    pub customer_name: Option<String>,
    pub amount: i64,
    pub admin: i64,
    pub buy_price: i64,
    pub sell_price: i64,
    pub failed_reason: Option<String>,
    pub failed_code: Option<String>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub callback_sent: bool,
    pub callback_sent_at: Option<DateTime<Utc>>,
    pub claimed_until: Option<DateTime<Utc>>,
}

/// Values for a freshly accepted transaction; always inserted as `Processing`.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub transaction_id: String,
    pub client_id: i64,
    pub reference_id: String,
    pub r#type: TransactionType,
    pub product_id: i64,
    pub product_code: String,
    pub customer_no: String,
    pub sku_id: Option<i64>,
    pub provider_id: Option<i64>,
    pub provider_code: Option<String>,
    pub provider_sku_code: Option<String>,
    pub provider_ref_id: Option<String>,
    pub is_sandbox: bool,
    pub inquiry_id: Option<String>,
    pub customer_name: Option<String>,
    pub amount: i64,
    pub admin: i64,
    pub buy_price: i64,
    pub sell_price: i64,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

/// A single write against a non-terminal transaction. `None` fields keep the
/// stored value, except `next_retry_at` which is always written.
#[derive(Debug, Clone)]
pub struct TransactionUpdate {
    pub status: TransactionStatus,
    pub sku_id: Option<i64>,
    pub provider_id: Option<i64>,
    pub provider_code: Option<String>,
    pub provider_sku_code: Option<String>,
    pub provider_ref_id: Option<String>,
    pub ref_sequence: Option<i32>,
    pub serial_number: Option<String>,
    pub customer_name: Option<String>,
    pub amount: Option<i64>,
    pub admin: Option<i64>,
    pub buy_price: Option<i64>,
    pub failed_reason: Option<String>,
    pub failed_code: Option<String>,
    pub retry_increment: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub metadata: Option<JsonValue>,
}

impl TransactionUpdate {
    pub fn status(status: TransactionStatus) -> Self {
        Self {
            status,
            sku_id: None,
            provider_id: None,
            provider_code: None,
            provider_sku_code: None,
            provider_ref_id: None,
            ref_sequence: None,
            serial_number: None,
            customer_name: None,
            amount: None,
            admin: None,
            buy_price: None,
            failed_reason: None,
            failed_code: None,
            retry_increment: 0,
            next_retry_at: None,
            processed_at: None,
            metadata: None,
        }
    }

    /// Applies the update in place. Used by the in-memory store and mirrors
    /// the Postgres `UPDATE` statement column for column.
    pub fn apply_to(&self, tx: &mut Transaction, now: DateTime<Utc>) {
        tx.status = self.status;
        if let Some(v) = self.sku_id {
            tx.sku_id = Some(v);
        }
        if let Some(v) = self.provider_id {
            tx.provider_id = Some(v);
        }
        if let Some(v) = &self.provider_code {
            tx.provider_code = Some(v.clone());
        }
        if let Some(v) = &self.provider_sku_code {
            tx.provider_sku_code = Some(v.clone());
        }
        if let Some(v) = &self.provider_ref_id {
            tx.provider_ref_id = Some(v.clone());
        }
        if let Some(v) = self.ref_sequence {
            tx.ref_sequence = v;
        }
        if let Some(v) = &self.serial_number {
            tx.serial_number = Some(v.clone());
        }
        if let Some(v) = &self.customer_name {
            tx.customer_name = Some(v.clone());
        }
        if let Some(v) = self.amount {
            tx.amount = v;
        }
        if let Some(v) = self.admin {
            tx.admin = v;
        }
        if let Some(v) = self.buy_price {
            tx.buy_price = v;
        }
        if let Some(v) = &self.failed_reason {
            tx.failed_reason = Some(v.clone());
        }
        if let Some(v) = &self.failed_code {
            tx.failed_code = Some(v.clone());
        }
        tx.retry_count += self.retry_increment;
        tx.next_retry_at = self.next_retry_at;
        if let Some(v) = self.processed_at {
            tx.processed_at = Some(v);
        }
        if let Some(JsonValue::Object(extra)) = &self.metadata {
            if let JsonValue::Object(existing) = &mut tx.metadata {
                for (k, v) in extra {
                    existing.insert(k.clone(), v.clone());
                }
            } else {
                tx.metadata = JsonValue::Object(extra.clone());
            }
        }
        tx.updated_at = now;
        tx.claimed_until = None;
    }
}

// ============================================================================
// Outbound webhook log
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CallbackEvent {
    #[serde(rename = "transaction.success")]
    Success,
    #[serde(rename = "transaction.failed")]
    Failed,
    #[serde(rename = "transaction.pending")]
    Pending,
}

impl CallbackEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackEvent::Success => "transaction.success",
            CallbackEvent::Failed => "transaction.failed",
            CallbackEvent::Pending => "transaction.pending",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "transaction.success" => Some(CallbackEvent::Success),
            "transaction.failed" => Some(CallbackEvent::Failed),
            "transaction.pending" => Some(CallbackEvent::Pending),
            _ => None,
        }
    }

    pub fn for_status(status: TransactionStatus) -> Option<Self> {
        match status {
            TransactionStatus::Success => Some(CallbackEvent::Success),
            TransactionStatus::Failed => Some(CallbackEvent::Failed),
            TransactionStatus::Pending => Some(CallbackEvent::Pending),
            TransactionStatus::Processing => None,
        }
    }
}

impl std::fmt::Display for CallbackEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackLog {
    pub id: i64,
    pub transaction_id: String,
    pub client_id: i64,
    pub event: CallbackEvent,
    pub url: String,
    /// Exact bytes sent on every attempt.
    pub payload: String,
    pub attempt: i32,
    pub http_status: Option<i32>,
    pub response_body: Option<String>,
    pub is_delivered: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCallbackLog {
    pub transaction_id: String,
    pub client_id: i64,
    pub event: CallbackEvent,
    pub url: String,
    pub payload: String,
    /// Safety net in case the first attempt never records its result.
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CallbackAttempt {
    pub attempt: i32,
    pub http_status: Option<i32>,
    pub response_body: Option<String>,
    pub delivered: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Inbound provider callback
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderCallback {
    pub id: i64,
    pub provider_code: String,
    pub ref_id: String,
    pub rc: Option<String>,
    pub status: Option<String>,
    pub message: Option<String>,
    pub serial_number: Option<String>,
    pub price: Option<i64>,
    pub payload: JsonValue,
    pub is_processed: bool,
    pub process_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewProviderCallback {
    pub provider_code: String,
    pub ref_id: String,
    pub rc: Option<String>,
    pub status: Option<String>,
    pub message: Option<String>,
    pub serial_number: Option<String>,
    pub price: Option<i64>,
    pub payload: JsonValue,
}

// ============================================================================
// Catalog (read-only here)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub category: String,
    pub is_postpaid: bool,
    pub sell_price: i64,
    pub admin_fee: i64,
    pub is_active: bool,
}

/// Catalog row behind a `ProviderOption`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSku {
    pub id: i64,
    pub provider_id: i64,
    pub provider_code: String,
    pub product_id: i64,
    pub sku_code: String,
    pub price: i64,
    pub admin: i64,
    pub commission: i64,
    pub is_backup: bool,
    /// Provider-level priority, lower first; breaks price ties.
    pub priority: i32,
    pub is_active: bool,
}

/// Legacy single-provider SKU with priority fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sku {
    pub id: i64,
    pub product_id: i64,
    pub digi_sku_code: String,
    /// 1 = main, 2 = backup-1, 3 = backup-2
    pub priority: i32,
    pub price: i64,
    pub cut_off_start: NaiveTime,
    pub cut_off_end: NaiveTime,
    pub is_active: bool,
    pub stock: i64,
    pub unlimited_stock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Client {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub callback_url: Option<String>,
    pub callback_secret: String,
    pub is_active: bool,
}
