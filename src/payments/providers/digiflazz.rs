use crate::payments::error::{ProviderError, ProviderResult};
use crate::payments::provider::ProviderAdapter;
use crate::payments::rc::{digiflazz_table, Outcome};
use crate::payments::types::{
    ParsedCallback, PriceListItem, ProviderRequest, ProviderResponse, StatusQuery,
    TransactionType, WebhookVerificationResult,
};
use crate::payments::utils::{verify_hmac_sha256_hex, ProviderHttpClient};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::{debug, info};

pub const PROVIDER_CODE: &str = "digiflazz";

#[derive(Debug, Clone)]
pub struct DigiflazzConfig {
    pub username: String,
    pub api_key: String,
    /// Development key, used together with `testing: true` for sandbox traffic.
    pub dev_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for DigiflazzConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            api_key: String::new(),
            dev_key: None,
            webhook_secret: None,
            base_url: "https://api.digiflazz.com".to_string(),
            timeout_secs: 30,
        }
    }
}

impl DigiflazzConfig {
    pub fn from_env() -> ProviderResult<Self> {
        let username =
            std::env::var("DIGIFLAZZ_USERNAME").map_err(|_| ProviderError::Configuration {
                message: "DIGIFLAZZ_USERNAME environment variable is required".to_string(),
            })?;
        let api_key =
            std::env::var("DIGIFLAZZ_API_KEY").map_err(|_| ProviderError::Configuration {
                message: "DIGIFLAZZ_API_KEY environment variable is required".to_string(),
            })?;

        Ok(Self {
            username,
            api_key,
            dev_key: std::env::var("DIGIFLAZZ_DEV_KEY").ok(),
            webhook_secret: std::env::var("DIGIFLAZZ_WEBHOOK_SECRET").ok(),
            base_url: std::env::var("DIGIFLAZZ_BASE_URL")
                .unwrap_or_else(|_| "https://api.digiflazz.com".to_string()),
            timeout_secs: std::env::var("PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
        })
    }
}

pub struct DigiflazzAdapter {
    config: DigiflazzConfig,
    http: ProviderHttpClient,
}

impl DigiflazzAdapter {
    pub fn new(config: DigiflazzConfig) -> ProviderResult<Self> {
        let http = ProviderHttpClient::new(PROVIDER_CODE, Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> ProviderResult<Self> {
        Self::new(DigiflazzConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn key(&self, sandbox: bool) -> &str {
        match (&self.config.dev_key, sandbox) {
            (Some(dev_key), true) => dev_key,
            _ => &self.config.api_key,
        }
    }

    /// `md5(username + key + ref_id)`
    pub fn sign(&self, ref_id: &str, sandbox: bool) -> String {
        sign(&self.config.username, self.key(sandbox), ref_id)
    }

    fn transaction_body(
        &self,
        command: Option<&str>,
        request: &ProviderRequest,
    ) -> JsonValue {
        let mut body = json!({
            "username": self.config.username,
            "buyer_sku_code": request.sku_code,
            "customer_no": request.customer_no,
            "ref_id": request.ref_id,
            "sign": self.sign(&request.ref_id, request.sandbox),
        });
        if let Some(command) = command {
            body["commands"] = json!(command);
        }
        if request.sandbox {
            body["testing"] = json!(true);
        }
        body
    }

    async fn send_transaction(
        &self,
        command: Option<&str>,
        request: &ProviderRequest,
    ) -> ProviderResult<ProviderResponse> {
        let body = self.transaction_body(command, request);
        debug!(
            ref_id = %request.ref_id,
            sku = %request.sku_code,
            command = command.unwrap_or("topup"),
            sandbox = request.sandbox,
            "sending digiflazz transaction"
        );

        let envelope: Envelope = self
            .http
            .post_json(&self.endpoint("/v1/transaction"), &body, &[])
            .await?;
        to_response(envelope.data, &request.ref_id)
    }
}

pub fn sign(username: &str, key: &str, suffix: &str) -> String {
    format!("{:x}", md5::compute(format!("{}{}{}", username, key, suffix)))
}

#[async_trait]
impl ProviderAdapter for DigiflazzAdapter {
    async fn topup(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        self.send_transaction(None, request).await
    }

    async fn inquiry(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        self.send_transaction(Some("inq-pasca"), request).await
    }

    async fn payment(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        self.send_transaction(Some("pay-pasca"), request).await
    }

    async fn check_status(&self, query: &StatusQuery) -> ProviderResult<ProviderResponse> {
        let request = ProviderRequest {
            sku_code: query.sku_code.clone(),
            customer_no: query.customer_no.clone(),
            ref_id: query.ref_id.clone(),
            sandbox: query.sandbox,
        };
        match query.transaction_type {
            // replaying a prepaid ref_id returns the existing transaction
            TransactionType::Prepaid => self.send_transaction(None, &request).await,
            TransactionType::Inquiry | TransactionType::Payment => {
                self.send_transaction(Some("status-pasca"), &request).await
            }
        }
    }

    async fn price_list(&self, category: &str) -> ProviderResult<Vec<PriceListItem>> {
        let cmd = if category.eq_ignore_ascii_case("pasca") || category.eq_ignore_ascii_case("postpaid") {
            "pasca"
        } else {
            "prepaid"
        };
        let body = json!({
            "cmd": cmd,
            "username": self.config.username,
            "sign": sign(&self.config.username, &self.config.api_key, "pricelist"),
        });

        let envelope: Envelope = self
            .http
            .post_json(&self.endpoint("/v1/price-list"), &body, &[])
            .await?;

        let items = match envelope.data {
            JsonValue::Array(items) => items,
            other => {
                return Err(ProviderError::InvalidResponse {
                    provider: PROVIDER_CODE.to_string(),
                    message: format!(
                        "price list rejected: {}",
                        other
                            .get("message")
                            .and_then(JsonValue::as_str)
                            .unwrap_or("unexpected payload")
                    ),
                })
            }
        };

        let mut products = Vec::with_capacity(items.len());
        for item in items {
            let row: PriceListRow =
                serde_json::from_value(item).map_err(|e| ProviderError::InvalidResponse {
                    provider: PROVIDER_CODE.to_string(),
                    message: format!("invalid price list row: {}", e),
                })?;
            products.push(row.into_item());
        }

        info!(cmd = cmd, count = products.len(), "digiflazz price list fetched");
        Ok(products)
    }

    fn code(&self) -> &str {
        PROVIDER_CODE
    }

    fn is_healthy(&self) -> bool {
        !self.config.username.is_empty() && !self.config.api_key.is_empty()
    }

    fn classify(&self, rc: &str) -> Outcome {
        digiflazz_table().classify(rc)
    }

    fn verify_callback(&self, payload: &[u8], signature: Option<&str>) -> WebhookVerificationResult {
        let secret = self
            .config
            .webhook_secret
            .as_deref()
            .unwrap_or(&self.config.api_key);
        if secret.is_empty() {
            return WebhookVerificationResult {
                valid: false,
                reason: Some("no callback secret configured".to_string()),
            };
        }

        match signature {
            Some(signature) if verify_hmac_sha256_hex(payload, secret, signature) => {
                WebhookVerificationResult {
                    valid: true,
                    reason: None,
                }
            }
            Some(_) => WebhookVerificationResult {
                valid: false,
                reason: Some("signature mismatch".to_string()),
            },
            None => WebhookVerificationResult {
                valid: false,
                reason: Some("missing signature header".to_string()),
            },
        }
    }

    fn parse_callback(&self, payload: &[u8]) -> ProviderResult<ParsedCallback> {
        let envelope: Envelope =
            serde_json::from_slice(payload).map_err(|e| ProviderError::InvalidResponse {
                provider: PROVIDER_CODE.to_string(),
                message: format!("invalid callback payload: {}", e),
            })?;
        let data: TransactionData =
            serde_json::from_value(envelope.data).map_err(|e| ProviderError::InvalidResponse {
                provider: PROVIDER_CODE.to_string(),
                message: format!("invalid callback data: {}", e),
            })?;

        if data.ref_id.trim().is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: PROVIDER_CODE.to_string(),
                message: "callback without ref_id".to_string(),
            });
        }

        Ok(ParsedCallback {
            ref_id: data.ref_id,
            rc: data.rc.filter(|rc| !rc.is_empty()),
            status: data.status,
            message: data.message,
            serial_number: data.sn.filter(|sn| !sn.is_empty()),
            price: data.price,
        })
    }

    fn callback_signature_header(&self) -> Option<&'static str> {
        Some("x-hub-signature")
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    data: JsonValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TransactionData {
    ref_id: String,
    message: Option<String>,
    status: Option<String>,
    rc: Option<String>,
    sn: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    price: Option<i64>,
    customer_name: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    admin: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    selling_price: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PriceListRow {
    product_name: String,
    category: String,
    brand: Option<String>,
    buyer_sku_code: String,
    #[serde(deserialize_with = "lenient_i64")]
    price: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    admin: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    commission: Option<i64>,
    buyer_product_status: Option<bool>,
    seller_product_status: Option<bool>,
    unlimited_stock: Option<bool>,
    #[serde(deserialize_with = "lenient_i64")]
    stock: Option<i64>,
    start_cut_off: Option<String>,
    end_cut_off: Option<String>,
}

impl PriceListRow {
    fn into_item(self) -> PriceListItem {
        PriceListItem {
            sku_code: self.buyer_sku_code,
            product_name: self.product_name,
            category: self.category,
            brand: self.brand,
            price: self.price.unwrap_or_default(),
            admin: self.admin,
            commission: self.commission,
            is_active: self.buyer_product_status.unwrap_or(true)
                && self.seller_product_status.unwrap_or(true),
            unlimited_stock: self.unlimited_stock.unwrap_or(false),
            stock: self.stock,
            cut_off_start: self.start_cut_off,
            cut_off_end: self.end_cut_off,
        }
    }
}

/// Digiflazz mixes numbers and numeric strings across endpoints.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(JsonValue::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    })
}

fn to_response(data: JsonValue, ref_id: &str) -> ProviderResult<ProviderResponse> {
    let parsed: TransactionData =
        serde_json::from_value(data.clone()).map_err(|e| ProviderError::InvalidResponse {
            provider: PROVIDER_CODE.to_string(),
            message: format!("invalid transaction data: {}", e),
        })?;

    let rc = parsed.rc.clone().unwrap_or_default();
    if rc.is_empty() {
        return Err(ProviderError::InvalidResponse {
            provider: PROVIDER_CODE.to_string(),
            message: "response without rc".to_string(),
        });
    }

    Ok(ProviderResponse {
        ref_id: if parsed.ref_id.is_empty() {
            ref_id.to_string()
        } else {
            parsed.ref_id
        },
        rc,
        status: parsed.status,
        message: parsed.message,
        serial_number: parsed.sn.filter(|sn| !sn.is_empty()),
        price: parsed.price,
        customer_name: parsed.customer_name,
        amount: parsed.selling_price.or(parsed.price),
        admin: parsed.admin,
        raw: Some(data),
    })
}
