//! Generic host-to-host biller speaking signed JSON over HTTPS.
//!
//! Every request body is signed with HMAC-SHA256 (`X-Signature: sha256=<hex>`)
//! using the member secret; callbacks are signed the same way. Response codes
//! follow ISO-8583 conventions (see [`crate::payments::rc::h2h_table`]).

use crate::payments::error::{ProviderError, ProviderResult};
use crate::payments::provider::ProviderAdapter;
use crate::payments::rc::{h2h_table, Outcome};
use crate::payments::types::{
    ParsedCallback, PriceListItem, ProviderRequest, ProviderResponse, StatusQuery,
    WebhookVerificationResult,
};
use crate::payments::utils::{hmac_sha256_hex, verify_hmac_sha256_hex, ProviderHttpClient};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct H2hConfig {
    pub code: String,
    pub base_url: String,
    pub sandbox_url: Option<String>,
    pub member_id: String,
    pub secret: String,
    pub timeout_secs: u64,
}

impl H2hConfig {
    /// Reads `H2H_<CODE>_BASE_URL`, `_SANDBOX_URL`, `_MEMBER_ID`, `_SECRET`.
    pub fn from_env(code: &str) -> ProviderResult<Self> {
        let prefix = format!("H2H_{}", code.trim().to_uppercase().replace('-', "_"));
        let required = |suffix: &str| -> ProviderResult<String> {
            let name = format!("{}_{}", prefix, suffix);
            std::env::var(&name).map_err(|_| ProviderError::Configuration {
                message: format!("{} environment variable is required", name),
            })
        };

        Ok(Self {
            code: code.trim().to_lowercase(),
            base_url: required("BASE_URL")?,
            sandbox_url: std::env::var(format!("{}_SANDBOX_URL", prefix)).ok(),
            member_id: required("MEMBER_ID")?,
            secret: required("SECRET")?,
            timeout_secs: std::env::var("PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
        })
    }
}

pub struct H2hAdapter {
    config: H2hConfig,
    http: ProviderHttpClient,
    enabled: AtomicBool,
}

impl H2hAdapter {
    pub fn new(config: H2hConfig) -> ProviderResult<Self> {
        let http = ProviderHttpClient::new(config.code.clone(), Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            config,
            http,
            enabled: AtomicBool::new(true),
        })
    }

    /// Administrative switch; a disabled adapter reports unhealthy.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn endpoint(&self, path: &str, sandbox: bool) -> String {
        let base = match (&self.config.sandbox_url, sandbox) {
            (Some(url), true) => url,
            _ => &self.config.base_url,
        };
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    async fn call(&self, path: &str, sandbox: bool, body: JsonValue) -> ProviderResult<ProviderResponse> {
        let bytes = serde_json::to_vec(&body).map_err(|e| ProviderError::InvalidResponse {
            provider: self.config.code.clone(),
            message: format!("failed to encode request: {}", e),
        })?;
        let signature = format!("sha256={}", hmac_sha256_hex(&self.config.secret, &bytes));
        debug!(provider = %self.config.code, path = path, sandbox = sandbox, "sending h2h request");

        let reply: H2hReply = self
            .http
            .post_bytes(
                &self.endpoint(path, sandbox),
                bytes,
                &[("X-Signature", signature.as_str()), ("X-Member-Id", self.config.member_id.as_str())],
            )
            .await?;
        reply.into_response(&self.config.code, body["ref_id"].as_str().unwrap_or_default())
    }

    fn request_body(&self, request: &ProviderRequest) -> JsonValue {
        json!({
            "member_id": self.config.member_id,
            "product": request.sku_code,
            "dest": request.customer_no,
            "ref_id": request.ref_id,
        })
    }
}

#[async_trait]
impl ProviderAdapter for H2hAdapter {
    async fn topup(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        self.call("/topup", request.sandbox, self.request_body(request)).await
    }

    async fn inquiry(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        self.call("/inquiry", request.sandbox, self.request_body(request)).await
    }

    async fn payment(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        self.call("/payment", request.sandbox, self.request_body(request)).await
    }

    async fn check_status(&self, query: &StatusQuery) -> ProviderResult<ProviderResponse> {
        let body = json!({
            "member_id": self.config.member_id,
            "ref_id": query.ref_id,
        });
        self.call("/status", query.sandbox, body).await
    }

    async fn price_list(&self, category: &str) -> ProviderResult<Vec<PriceListItem>> {
        let body = json!({
            "member_id": self.config.member_id,
            "category": category,
        });
        let bytes = serde_json::to_vec(&body).map_err(|e| ProviderError::InvalidResponse {
            provider: self.config.code.clone(),
            message: format!("failed to encode request: {}", e),
        })?;
        let signature = format!("sha256={}", hmac_sha256_hex(&self.config.secret, &bytes));

        let reply: H2hPriceList = self
            .http
            .post_bytes(
                &self.endpoint("/pricelist", false),
                bytes,
                &[("X-Signature", signature.as_str()), ("X-Member-Id", self.config.member_id.as_str())],
            )
            .await?;

        Ok(reply
            .products
            .into_iter()
            .map(|p| PriceListItem {
                sku_code: p.code,
                product_name: p.name,
                category: category.to_string(),
                brand: p.brand,
                price: p.price,
                admin: p.admin,
                commission: p.commission,
                is_active: p.status.as_deref().map(|s| s == "active").unwrap_or(true),
                unlimited_stock: true,
                stock: None,
                cut_off_start: None,
                cut_off_end: None,
            })
            .collect())
    }

    fn code(&self) -> &str {
        &self.config.code
    }

    fn is_healthy(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn classify(&self, rc: &str) -> Outcome {
        h2h_table().classify(rc)
    }

    fn verify_callback(&self, payload: &[u8], signature: Option<&str>) -> WebhookVerificationResult {
        match signature {
            Some(signature) if verify_hmac_sha256_hex(payload, &self.config.secret, signature) => {
                WebhookVerificationResult {
                    valid: true,
                    reason: None,
                }
            }
            Some(_) => {
                warn!(provider = %self.config.code, "h2h callback signature mismatch");
                WebhookVerificationResult {
                    valid: false,
                    reason: Some("signature mismatch".to_string()),
                }
            }
            None => WebhookVerificationResult {
                valid: false,
                reason: Some("missing signature header".to_string()),
            },
        }
    }

    fn parse_callback(&self, payload: &[u8]) -> ProviderResult<ParsedCallback> {
        let reply: H2hReply =
            serde_json::from_slice(payload).map_err(|e| ProviderError::InvalidResponse {
                provider: self.config.code.clone(),
                message: format!("invalid callback payload: {}", e),
            })?;
        let ref_id = reply.ref_id.unwrap_or_default();
        if ref_id.trim().is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: self.config.code.clone(),
                message: "callback without ref_id".to_string(),
            });
        }

        Ok(ParsedCallback {
            ref_id,
            rc: reply.rc,
            status: reply.status,
            message: reply.message,
            serial_number: reply.sn,
            price: reply.price,
        })
    }

    fn callback_signature_header(&self) -> Option<&'static str> {
        Some("x-signature")
    }
}

#[derive(Debug, Deserialize)]
struct H2hReply {
    rc: Option<String>,
    status: Option<String>,
    message: Option<String>,
    ref_id: Option<String>,
    sn: Option<String>,
    price: Option<i64>,
    amount: Option<i64>,
    admin: Option<i64>,
    customer_name: Option<String>,
}

impl H2hReply {
    fn into_response(self, provider: &str, ref_id: &str) -> ProviderResult<ProviderResponse> {
        let raw = json!({
            "rc": self.rc,
            "status": self.status,
            "message": self.message,
            "ref_id": self.ref_id,
        });
        let rc = self.rc.filter(|rc| !rc.trim().is_empty()).ok_or_else(|| {
            ProviderError::InvalidResponse {
                provider: provider.to_string(),
                message: "response without rc".to_string(),
            }
        })?;

        Ok(ProviderResponse {
            ref_id: self.ref_id.unwrap_or_else(|| ref_id.to_string()),
            rc,
            status: self.status,
            message: self.message,
            serial_number: self.sn,
            price: self.price,
            customer_name: self.customer_name,
            amount: self.amount,
            admin: self.admin,
            raw: Some(raw),
        })
    }
}

#[derive(Debug, Deserialize)]
struct H2hPriceList {
    products: Vec<H2hProduct>,
}

#[derive(Debug, Deserialize)]
struct H2hProduct {
    code: String,
    name: String,
    brand: Option<String>,
    price: i64,
    admin: Option<i64>,
    commission: Option<i64>,
    status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: String) -> H2hConfig {
        H2hConfig {
            code: "biller".to_string(),
            base_url,
            sandbox_url: None,
            member_id: "M001".to_string(),
            secret: "h2h-secret".to_string(),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn requests_are_signed_over_exact_body() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({
            "member_id": "M001",
            "product": "PLN20",
            "dest": "14000000001",
            "ref_id": "TRX-20260101-000002",
        });
        let bytes = serde_json::to_vec(&body).unwrap();
        let expected = format!("sha256={}", hmac_sha256_hex("h2h-secret", &bytes));

        let mock = server
            .mock("POST", "/topup")
            .match_header("x-signature", expected.as_str())
            .match_header("x-member-id", "M001")
            .with_status(200)
            .with_body(r#"{"rc":"68","status":"PENDING","ref_id":"TRX-20260101-000002"}"#)
            .create_async()
            .await;

        let adapter = H2hAdapter::new(config(server.url())).unwrap();
        let response = adapter
            .topup(&ProviderRequest {
                sku_code: "PLN20".to_string(),
                customer_no: "14000000001".to_string(),
                ref_id: "TRX-20260101-000002".to_string(),
                sandbox: false,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(adapter.classify(&response.rc), Outcome::Pending);
    }

    #[test]
    fn disabled_adapter_reports_unhealthy() {
        let adapter = H2hAdapter::new(config("http://localhost".to_string())).unwrap();
        assert!(adapter.is_healthy());
        adapter.set_enabled(false);
        assert!(!adapter.is_healthy());
    }

    #[test]
    fn sandbox_requests_use_sandbox_url() {
        let mut cfg = config("https://live.example".to_string());
        cfg.sandbox_url = Some("https://sandbox.example/".to_string());
        let adapter = H2hAdapter::new(cfg).unwrap();

        assert_eq!(adapter.endpoint("/topup", true), "https://sandbox.example/topup");
        assert_eq!(adapter.endpoint("/topup", false), "https://live.example/topup");
    }

    #[test]
    fn callback_requires_valid_signature() {
        let adapter = H2hAdapter::new(config("http://localhost".to_string())).unwrap();
        let payload = br#"{"rc":"00","ref_id":"TRX-20260101-000002-2","sn":"TOKEN-1234"}"#;
        let signature = hmac_sha256_hex("h2h-secret", payload);

        assert!(adapter.verify_callback(payload, Some(&signature)).valid);
        assert!(!adapter.verify_callback(payload, None).valid);

        let parsed = adapter.parse_callback(payload).unwrap();
        assert_eq!(parsed.ref_id, "TRX-20260101-000002-2");
        assert_eq!(parsed.serial_number.as_deref(), Some("TOKEN-1234"));
    }
}
