use crate::payments::error::ProviderError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Prepaid,
    Inquiry,
    Payment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Prepaid => "prepaid",
            TransactionType::Inquiry => "inquiry",
            TransactionType::Payment => "payment",
        }
    }

    /// Inquiry and payment both belong to the two-phase bill flow.
    pub fn is_postpaid(&self) -> bool {
        matches!(self, TransactionType::Inquiry | TransactionType::Payment)
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = ProviderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "prepaid" | "topup" => Ok(TransactionType::Prepaid),
            "inquiry" => Ok(TransactionType::Inquiry),
            "payment" => Ok(TransactionType::Payment),
            _ => Err(ProviderError::InvalidResponse {
                provider: "catalog".to_string(),
                message: format!("unsupported transaction type: {}", value),
            }),
        }
    }
}

/// Unified request handed to an adapter for topup, inquiry and payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub sku_code: String,
    pub customer_no: String,
    /// Idempotency token sent upstream (`transaction_id` or `transaction_id-N`).
    pub ref_id: String,
    pub sandbox: bool,
}

/// Status lookups are keyed by `ref_id`; the remaining fields are hints for
/// upstreams that can only answer by replaying the original request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusQuery {
    pub ref_id: String,
    pub transaction_type: TransactionType,
    pub sku_code: String,
    pub customer_no: String,
    pub sandbox: bool,
}

/// Normalized provider answer. `rc` is the raw provider code; the adapter's
/// RC table turns it into an `Outcome`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderResponse {
    pub ref_id: String,
    pub rc: String,
    pub status: Option<String>,
    pub message: Option<String>,
    pub serial_number: Option<String>,
    pub price: Option<i64>,
    pub customer_name: Option<String>,
    pub amount: Option<i64>,
    pub admin: Option<i64>,
    pub raw: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceListItem {
    pub sku_code: String,
    pub product_name: String,
    pub category: String,
    pub brand: Option<String>,
    pub price: i64,
    pub admin: Option<i64>,
    pub commission: Option<i64>,
    pub is_active: bool,
    pub unlimited_stock: bool,
    pub stock: Option<i64>,
    pub cut_off_start: Option<String>,
    pub cut_off_end: Option<String>,
}

/// Provider-pushed callback after the adapter has parsed its own payload shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedCallback {
    pub ref_id: String,
    pub rc: Option<String>,
    pub status: Option<String>,
    pub message: Option<String>,
    pub serial_number: Option<String>,
    pub price: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookVerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
}
