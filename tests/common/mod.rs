#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveTime;
use chrono::FixedOffset;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ppob_gateway::cache::inquiry::MemoryInquiryCache;
use ppob_gateway::database::memory::MemoryStore;
use ppob_gateway::database::models::{Client, Product, ProviderSku, Sku};
use ppob_gateway::database::Stores;
use ppob_gateway::payments::error::{ProviderError, ProviderResult};
use ppob_gateway::payments::health::ProviderHealthRegistry;
use ppob_gateway::payments::provider::ProviderAdapter;
use ppob_gateway::payments::rc::{digiflazz_table, Outcome};
use ppob_gateway::payments::types::{
    ParsedCallback, PriceListItem, ProviderRequest, ProviderResponse, StatusQuery,
    WebhookVerificationResult,
};
use ppob_gateway::payments::utils::{hmac_sha256_hex, verify_hmac_sha256_hex};
use ppob_gateway::services::callback::{
    CallbackConfig, CallbackDispatcher, CallbackError, CallbackHeaders, CallbackService,
    CallbackTransport, TransportResponse,
};
use ppob_gateway::services::provider_router::{ProviderRouter, RouterConfig};
use ppob_gateway::services::transaction_engine::{EngineConfig, TransactionEngine};
use ppob_gateway::services::ProviderCallbackService;

pub const CALLBACK_URL: &str = "https://client.example/callback";
pub const CLIENT_SECRET: &str = "client-secret";
pub const PROVIDER_SECRET: &str = "provider-secret";
pub const SIGNATURE_HEADER: &str = "x-test-signature";

// ============================================================================
// Scripted provider
// ============================================================================

/// One scripted provider answer.
#[derive(Debug, Clone)]
pub enum Step {
    Answer(ProviderResponse),
    Transport,
}

pub fn rc(code: &str) -> Step {
    Step::Answer(ProviderResponse {
        rc: code.to_string(),
        ..Default::default()
    })
}

pub fn bill(amount: i64, admin: i64, customer_name: &str) -> Step {
    Step::Answer(ProviderResponse {
        rc: "00".to_string(),
        amount: Some(amount),
        admin: Some(admin),
        customer_name: Some(customer_name.to_string()),
        ..Default::default()
    })
}

/// Answers calls from a script using the digiflazz RC table. An empty
/// script behaves like an unreachable upstream.
pub struct ScriptedAdapter {
    code: String,
    script: Mutex<VecDeque<Step>>,
    status_script: Mutex<VecDeque<Step>>,
    seen: Mutex<Vec<ProviderRequest>>,
    status_queries: Mutex<Vec<StatusQuery>>,
}

impl ScriptedAdapter {
    pub fn new(code: &str, script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            code: code.to_string(),
            script: Mutex::new(script.into()),
            status_script: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            status_queries: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn push_status(&self, step: Step) {
        self.status_script.lock().unwrap().push_back(step);
    }

    /// Reference tokens this provider has been sent, in order.
    pub fn ref_ids(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.ref_id.clone())
            .collect()
    }

    pub fn status_queries(&self) -> Vec<StatusQuery> {
        self.status_queries.lock().unwrap().clone()
    }

    fn answer(&self, ref_id: &str, step: Option<Step>) -> ProviderResult<ProviderResponse> {
        match step {
            Some(Step::Answer(mut response)) => {
                response.ref_id = ref_id.to_string();
                if response.rc == "00" && response.serial_number.is_none() {
                    response.serial_number = Some(format!("SN-{}", self.code));
                }
                Ok(response)
            }
            Some(Step::Transport) | None => Err(ProviderError::Transport {
                provider: self.code.clone(),
                message: "connection reset".to_string(),
            }),
        }
    }

    fn call(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        self.seen.lock().unwrap().push(request.clone());
        let step = self.script.lock().unwrap().pop_front();
        self.answer(&request.ref_id, step)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn topup(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        self.call(request)
    }

    async fn inquiry(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        self.call(request)
    }

    async fn payment(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        self.call(request)
    }

    async fn check_status(&self, query: &StatusQuery) -> ProviderResult<ProviderResponse> {
        self.status_queries.lock().unwrap().push(query.clone());
        let step = self.status_script.lock().unwrap().pop_front();
        self.answer(&query.ref_id, step)
    }

    async fn price_list(&self, category: &str) -> ProviderResult<Vec<PriceListItem>> {
        Ok(vec![PriceListItem {
            sku_code: format!("{}-XL10", self.code),
            product_name: "XL 10.000".to_string(),
            category: category.to_string(),
            brand: Some("XL".to_string()),
            price: 10_100,
            admin: None,
            commission: None,
            is_active: true,
            unlimited_stock: true,
            stock: None,
            cut_off_start: None,
            cut_off_end: None,
        }])
    }

    fn code(&self) -> &str {
        &self.code
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn classify(&self, rc: &str) -> Outcome {
        digiflazz_table().classify(rc)
    }

    fn verify_callback(&self, payload: &[u8], signature: Option<&str>) -> WebhookVerificationResult {
        let valid = signature
            .map(|sig| verify_hmac_sha256_hex(payload, PROVIDER_SECRET, sig))
            .unwrap_or(false);
        WebhookVerificationResult {
            valid,
            reason: (!valid).then(|| "signature mismatch".to_string()),
        }
    }

    fn parse_callback(&self, payload: &[u8]) -> ProviderResult<ParsedCallback> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| ProviderError::InvalidResponse {
                provider: self.code.clone(),
                message: e.to_string(),
            })?;
        let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(str::to_string);
        Ok(ParsedCallback {
            ref_id: field("ref_id").ok_or_else(|| ProviderError::InvalidResponse {
                provider: self.code.clone(),
                message: "missing ref_id".to_string(),
            })?,
            rc: field("rc"),
            status: field("status"),
            message: field("message"),
            serial_number: field("sn"),
            price: value.get("price").and_then(|v| v.as_i64()),
        })
    }

    fn callback_signature_header(&self) -> Option<&'static str> {
        Some(SIGNATURE_HEADER)
    }
}

/// Body and signature a scripted provider would push.
pub fn provider_callback(ref_id: &str, rc: &str, sn: Option<&str>) -> (Vec<u8>, String) {
    let mut body = serde_json::json!({ "ref_id": ref_id, "rc": rc });
    if let Some(sn) = sn {
        body["sn"] = serde_json::json!(sn);
    }
    let bytes = serde_json::to_vec(&body).unwrap();
    let signature = hmac_sha256_hex(PROVIDER_SECRET, &bytes);
    (bytes, signature)
}

// ============================================================================
// Recording webhook transport
// ============================================================================

#[derive(Debug, Clone)]
pub struct Delivery {
    pub url: String,
    pub headers: CallbackHeaders,
    pub body: String,
}

impl Delivery {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Records every POST and answers with queued statuses (200 once empty).
#[derive(Default)]
pub struct RecordingTransport {
    deliveries: Mutex<Vec<Delivery>>,
    statuses: Mutex<VecDeque<u16>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond_with(&self, statuses: &[u16]) {
        self.statuses.lock().unwrap().extend(statuses.iter().copied());
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.deliveries()
            .into_iter()
            .map(|d| d.headers.event)
            .collect()
    }
}

#[async_trait]
impl CallbackTransport for RecordingTransport {
    async fn post(
        &self,
        url: &str,
        headers: &CallbackHeaders,
        body: &[u8],
    ) -> Result<TransportResponse, CallbackError> {
        self.deliveries.lock().unwrap().push(Delivery {
            url: url.to_string(),
            headers: headers.clone(),
            body: String::from_utf8_lossy(body).to_string(),
        });
        let status = self.statuses.lock().unwrap().pop_front().unwrap_or(200);
        Ok(TransportResponse {
            status,
            body: if status == 200 { "OK" } else { "unavailable" }.to_string(),
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub stores: Stores,
    pub router: Arc<ProviderRouter>,
    pub inquiries: Arc<MemoryInquiryCache>,
    pub transport: Arc<RecordingTransport>,
    pub callbacks: Arc<CallbackService>,
    pub dispatcher: CallbackDispatcher,
    pub engine: Arc<TransactionEngine>,
    pub provider_callbacks: Arc<ProviderCallbackService>,
    pub client: Client,
}

pub fn engine_config() -> EngineConfig {
    EngineConfig::default()
}

impl Harness {
    pub async fn new(adapters: Vec<Arc<ScriptedAdapter>>) -> Self {
        Self::with_config(adapters, engine_config()).await
    }

    pub async fn with_config(adapters: Vec<Arc<ScriptedAdapter>>, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let client = store
            .add_client(Client {
                id: 0,
                code: "acme".to_string(),
                name: "Acme Reseller".to_string(),
                callback_url: Some(CALLBACK_URL.to_string()),
                callback_secret: CLIENT_SECRET.to_string(),
                is_active: true,
            })
            .await;
        let stores = Stores::memory(store.clone());

        let map: HashMap<String, Arc<dyn ProviderAdapter>> = adapters
            .into_iter()
            .map(|a| (a.code().to_string(), a as Arc<dyn ProviderAdapter>))
            .collect();
        let router = Arc::new(ProviderRouter::new(
            map,
            stores.catalog.clone(),
            ProviderHealthRegistry::default(),
            RouterConfig {
                wait_cooldown: Duration::from_millis(1),
                ..RouterConfig::default()
            },
            FixedOffset::east_opt(7 * 3600).unwrap(),
        ));

        let transport = RecordingTransport::new();
        let callbacks = Arc::new(CallbackService::new(
            stores.transactions.clone(),
            stores.callback_logs.clone(),
            stores.catalog.clone(),
            transport.clone(),
            CallbackConfig::default(),
        ));
        let dispatcher = CallbackDispatcher::new(callbacks.clone());
        let inquiries = Arc::new(MemoryInquiryCache::new());
        let engine = Arc::new(TransactionEngine::new(
            &stores,
            router.clone(),
            inquiries.clone(),
            dispatcher.clone(),
            config,
        ));
        let provider_callbacks = Arc::new(ProviderCallbackService::new(
            router.clone(),
            stores.provider_callbacks.clone(),
            stores.transactions.clone(),
            engine.clone(),
            Duration::from_secs(120),
        ));

        Self {
            store,
            stores,
            router,
            inquiries,
            transport,
            callbacks,
            dispatcher,
            engine,
            provider_callbacks,
            client,
        }
    }

    /// Waits for every webhook dispatched so far.
    pub async fn settle(&self) {
        self.dispatcher.drain().await;
    }

    pub async fn prepaid_product(&self, code: &str) -> Product {
        self.store
            .add_product(Product {
                id: 0,
                code: code.to_string(),
                name: format!("{} pulsa", code),
                category: "pulsa".to_string(),
                is_postpaid: false,
                sell_price: 10_500,
                admin_fee: 0,
                is_active: true,
            })
            .await
    }

    pub async fn postpaid_product(&self, code: &str) -> Product {
        self.store
            .add_product(Product {
                id: 0,
                code: code.to_string(),
                name: format!("{} bill", code),
                category: "pln".to_string(),
                is_postpaid: true,
                sell_price: 0,
                admin_fee: 2_500,
                is_active: true,
            })
            .await
    }

    pub async fn provider_sku(
        &self,
        product: &Product,
        provider_code: &str,
        price: i64,
        is_backup: bool,
    ) -> ProviderSku {
        self.store
            .add_provider_sku(ProviderSku {
                id: 0,
                provider_id: 100 + price,
                provider_code: provider_code.to_string(),
                product_id: product.id,
                sku_code: format!("{}-{}", provider_code, product.code),
                price,
                admin: 2_000,
                commission: 500,
                is_backup,
                priority: 1,
                is_active: true,
            })
            .await
    }

    /// Legacy SKU served by the `digiflazz` adapter, always open.
    pub async fn legacy_sku(&self, product: &Product, code: &str, priority: i32) -> Sku {
        self.store
            .add_sku(Sku {
                id: 0,
                product_id: product.id,
                digi_sku_code: code.to_string(),
                priority,
                price: 10_000 + i64::from(priority) * 100,
                cut_off_start: NaiveTime::MIN,
                cut_off_end: NaiveTime::MIN,
                is_active: true,
                stock: 0,
                unlimited_stock: true,
            })
            .await
    }
}
