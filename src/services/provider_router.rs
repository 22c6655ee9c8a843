//! Provider selection and failover.
//!
//! `select_providers` turns the catalog into an ordered option list, and
//! `execute_options` walks it: one attempt per option with a fresh reference
//! token, stopping at the first decisive or pending answer. Every call records
//! a health sample for the provider that served it.

use crate::database::models::{ProviderSku, Sku};
use crate::database::repository::{CatalogStore, DbResult};
use crate::payments::error::ProviderError;
use crate::payments::health::{HealthSample, ProviderHealth, ProviderHealthRegistry};
use crate::payments::provider::{invoke, ProviderAdapter};
use crate::payments::rc::Outcome;
use crate::payments::types::{ProviderRequest, ProviderResponse, TransactionType};
use crate::services::reference::RefTokens;
use crate::services::sku_fallback::SkuFallback;
use chrono::{FixedOffset, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Immediate same-token replays after a transport error.
    pub transport_retry_limit: u32,
    /// Same-option retries after a `RetryableWait` answer.
    pub wait_retry_limit: u32,
    pub wait_cooldown: Duration,
    /// Provider used for products that only have legacy SKUs.
    pub legacy_provider_code: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            transport_retry_limit: 1,
            wait_retry_limit: 1,
            wait_cooldown: Duration::from_millis(1500),
            legacy_provider_code: "digiflazz".to_string(),
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            transport_retry_limit: std::env::var("TRANSPORT_RETRY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.transport_retry_limit),
            wait_retry_limit: std::env::var("WAIT_RETRY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.wait_retry_limit),
            wait_cooldown: std::env::var("WAIT_COOLDOWN_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.wait_cooldown),
            legacy_provider_code: std::env::var("LEGACY_PROVIDER_CODE")
                .unwrap_or(defaults.legacy_provider_code),
        }
    }
}

// ---------------------------------------------------------------------------
// Options and ordering
// ---------------------------------------------------------------------------

/// One way of fulfilling a product: a provider plus the SKU it sells it under.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderOption {
    pub provider_id: Option<i64>,
    pub provider_code: String,
    /// Legacy `skus.id` when the option came from the fallback path.
    pub sku_id: Option<i64>,
    pub sku_code: String,
    pub price: i64,
    pub admin: i64,
    pub commission: i64,
    pub is_backup: bool,
    pub priority: i32,
}

impl ProviderOption {
    /// Net cost of collecting a bill through this option.
    pub fn effective_admin(&self) -> i64 {
        self.admin - self.commission
    }

    pub fn from_provider_sku(sku: &ProviderSku) -> Self {
        Self {
            provider_id: Some(sku.provider_id),
            provider_code: sku.provider_code.clone(),
            sku_id: None,
            sku_code: sku.sku_code.clone(),
            price: sku.price,
            admin: sku.admin,
            commission: sku.commission,
            is_backup: sku.is_backup,
            priority: sku.priority,
        }
    }

    pub fn from_legacy_sku(sku: &Sku, provider_code: &str) -> Self {
        Self {
            provider_id: None,
            provider_code: provider_code.to_string(),
            sku_id: Some(sku.id),
            sku_code: sku.digi_sku_code.clone(),
            price: sku.price,
            admin: 0,
            commission: 0,
            is_backup: sku.priority > 1,
            priority: sku.priority,
        }
    }
}

/// Prepaid: primaries before backups, each by unit price. Postpaid: by
/// `admin - commission`. Ties fall back to provider priority.
pub fn order_options(options: &mut [ProviderOption], transaction_type: TransactionType) {
    if transaction_type.is_postpaid() {
        options.sort_by_key(|o| (o.is_backup, o.effective_admin(), o.priority));
    } else {
        options.sort_by_key(|o| (o.is_backup, o.price, o.priority));
    }
}

// ---------------------------------------------------------------------------
// Attempt bookkeeping
// ---------------------------------------------------------------------------

/// What happened on one option. `outcome` is `None` when no classifiable
/// response came back.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub option: ProviderOption,
    pub ref_id: String,
    pub outcome: Option<Outcome>,
    pub response: Option<ProviderResponse>,
    pub error: Option<String>,
    pub latency: Duration,
}

impl AttemptResult {
    pub fn rc(&self) -> Option<&str> {
        self.response.as_ref().map(|r| r.rc.as_str())
    }

    pub fn message(&self) -> Option<String> {
        self.response
            .as_ref()
            .and_then(|r| r.message.clone())
            .or_else(|| self.error.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Success,
    Pending,
    /// Decisive failure: fatal on a backup, or every option answered fatal.
    Failed,
    /// Nothing decisive came back; the caller parks the transaction.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RouteReport {
    pub decision: RouteDecision,
    pub attempts: Vec<AttemptResult>,
    /// Tokens issued so far, to persist as `ref_sequence`.
    pub ref_sequence: i32,
}

impl RouteReport {
    pub fn last(&self) -> Option<&AttemptResult> {
        self.attempts.last()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct ProviderRouter {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    catalog: Arc<dyn CatalogStore>,
    fallback: SkuFallback,
    health: ProviderHealthRegistry,
    config: RouterConfig,
}

impl ProviderRouter {
    pub fn new(
        adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
        catalog: Arc<dyn CatalogStore>,
        health: ProviderHealthRegistry,
        config: RouterConfig,
        business_offset: FixedOffset,
    ) -> Self {
        Self {
            adapters,
            fallback: SkuFallback::new(catalog.clone(), business_offset),
            catalog,
            health,
            config,
        }
    }

    pub fn adapter(&self, code: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(code).cloned()
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn ProviderAdapter>> {
        self.adapters.values()
    }

    pub fn health(&self) -> &ProviderHealthRegistry {
        &self.health
    }

    /// Multi-provider mappings win; legacy SKUs are used only when a product
    /// has none. Legacy SKUs keep their priority order.
    pub async fn select_providers(
        &self,
        product_id: i64,
        transaction_type: TransactionType,
    ) -> DbResult<Vec<ProviderOption>> {
        let mapped = self.catalog.provider_skus(product_id).await?;
        if !mapped.is_empty() {
            let mut options: Vec<ProviderOption> = mapped
                .iter()
                .filter(|sku| sku.is_active)
                .map(ProviderOption::from_provider_sku)
                .collect();
            order_options(&mut options, transaction_type);
            return Ok(options);
        }

        let skus = self
            .fallback
            .get_available_skus(product_id, Utc::now())
            .await?;
        Ok(skus
            .iter()
            .map(|sku| ProviderOption::from_legacy_sku(sku, &self.config.legacy_provider_code))
            .collect())
    }

    /// Selects options for the product and routes through them.
    pub async fn execute(
        &self,
        product_id: i64,
        transaction_type: TransactionType,
        customer_no: &str,
        sandbox: bool,
        tokens: RefTokens,
    ) -> DbResult<RouteReport> {
        let options = self.select_providers(product_id, transaction_type).await?;
        Ok(self
            .execute_options(transaction_type, customer_no, sandbox, &options, tokens)
            .await)
    }

    pub async fn execute_options(
        &self,
        transaction_type: TransactionType,
        customer_no: &str,
        sandbox: bool,
        options: &[ProviderOption],
        mut tokens: RefTokens,
    ) -> RouteReport {
        let mut attempts = Vec::new();
        let mut all_fatal = !options.is_empty();

        for option in options {
            let Some(adapter) = self.routable_adapter(option).await else {
                all_fatal = false;
                continue;
            };

            let mut waits = 0;
            loop {
                let ref_id = tokens.next_token();
                let attempt = self
                    .attempt(adapter.as_ref(), transaction_type, option, customer_no, sandbox, ref_id)
                    .await;
                let outcome = attempt.outcome;
                attempts.push(attempt);

                match outcome {
                    Some(Outcome::Success) => {
                        return report(RouteDecision::Success, attempts, &tokens);
                    }
                    Some(Outcome::Pending) => {
                        return report(RouteDecision::Pending, attempts, &tokens);
                    }
                    Some(Outcome::Fatal) if option.is_backup => {
                        return report(RouteDecision::Failed, attempts, &tokens);
                    }
                    Some(Outcome::Fatal) => break,
                    Some(Outcome::RetryableWait) if waits < self.config.wait_retry_limit => {
                        waits += 1;
                        all_fatal = false;
                        debug!(
                            provider = %option.provider_code,
                            cooldown_ms = self.config.wait_cooldown.as_millis() as u64,
                            "provider asked to wait, retrying same sku"
                        );
                        tokio::time::sleep(self.config.wait_cooldown).await;
                    }
                    _ => {
                        all_fatal = false;
                        break;
                    }
                }
            }
        }

        let decision = if all_fatal {
            RouteDecision::Failed
        } else {
            RouteDecision::Exhausted
        };
        report(decision, attempts, &tokens)
    }

    async fn routable_adapter(&self, option: &ProviderOption) -> Option<Arc<dyn ProviderAdapter>> {
        let Some(adapter) = self.adapters.get(&option.provider_code) else {
            warn!(provider = %option.provider_code, "no adapter configured, skipping option");
            return None;
        };
        if !adapter.is_healthy() {
            debug!(provider = %option.provider_code, "adapter reports unhealthy, skipping");
            return None;
        }
        if self.health.health(&option.provider_code).await == ProviderHealth::Unhealthy {
            debug!(provider = %option.provider_code, "provider in cooldown, skipping");
            return None;
        }
        Some(adapter.clone())
    }

    /// One option, one token. Transport errors replay the identical request
    /// up to `transport_retry_limit` times before giving up on the option.
    async fn attempt(
        &self,
        adapter: &dyn ProviderAdapter,
        transaction_type: TransactionType,
        option: &ProviderOption,
        customer_no: &str,
        sandbox: bool,
        ref_id: String,
    ) -> AttemptResult {
        let request = ProviderRequest {
            sku_code: option.sku_code.clone(),
            customer_no: customer_no.to_string(),
            ref_id: ref_id.clone(),
            sandbox,
        };

        let mut replays = 0;
        loop {
            let started = Instant::now();
            let result = invoke(adapter, transaction_type, &request).await;
            let latency = started.elapsed();

            match result {
                Ok(response) => {
                    let outcome = adapter.classify(&response.rc);
                    self.health
                        .record(
                            &option.provider_code,
                            HealthSample {
                                ok: !outcome.is_retryable(),
                                latency,
                                failure_reason: outcome
                                    .is_retryable()
                                    .then(|| format!("rc {}", response.rc)),
                            },
                        )
                        .await;
                    info!(
                        provider = %option.provider_code,
                        ref_id = %ref_id,
                        rc = %response.rc,
                        outcome = %outcome,
                        latency_ms = latency.as_millis() as u64,
                        "provider attempt"
                    );
                    return AttemptResult {
                        option: option.clone(),
                        ref_id,
                        outcome: Some(outcome),
                        response: Some(response),
                        error: None,
                        latency,
                    };
                }
                Err(e) => {
                    self.health
                        .record(
                            &option.provider_code,
                            HealthSample {
                                ok: false,
                                latency,
                                failure_reason: Some(e.to_string()),
                            },
                        )
                        .await;
                    warn!(
                        provider = %option.provider_code,
                        ref_id = %ref_id,
                        error = %e,
                        latency_ms = latency.as_millis() as u64,
                        "provider attempt failed without response"
                    );

                    if e.is_transport() && replays < self.config.transport_retry_limit {
                        replays += 1;
                        continue;
                    }
                    return transport_failure(option, ref_id, &e, latency);
                }
            }
        }
    }
}

fn transport_failure(
    option: &ProviderOption,
    ref_id: String,
    error: &ProviderError,
    latency: Duration,
) -> AttemptResult {
    AttemptResult {
        option: option.clone(),
        ref_id,
        outcome: None,
        response: None,
        error: Some(error.to_string()),
        latency,
    }
}

fn report(decision: RouteDecision, attempts: Vec<AttemptResult>, tokens: &RefTokens) -> RouteReport {
    RouteReport {
        decision,
        attempts,
        ref_sequence: tokens.issued(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;
    use crate::payments::error::ProviderResult;
    use crate::payments::rc::digiflazz_table;
    use crate::payments::types::{
        ParsedCallback, PriceListItem, StatusQuery, WebhookVerificationResult,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn option(code: &str, price: i64, admin: i64, commission: i64, backup: bool) -> ProviderOption {
        ProviderOption {
            provider_id: Some(1),
            provider_code: code.to_string(),
            sku_id: None,
            sku_code: format!("{}-sku", code),
            price,
            admin,
            commission,
            is_backup: backup,
            priority: 1,
        }
    }

    #[test]
    fn prepaid_orders_primaries_by_price_then_backups() {
        let mut options = vec![
            option("backup-cheap", 900, 0, 0, true),
            option("b", 1_100, 0, 0, false),
            option("a", 1_000, 0, 0, false),
        ];
        order_options(&mut options, TransactionType::Prepaid);
        let codes: Vec<&str> = options.iter().map(|o| o.provider_code.as_str()).collect();
        assert_eq!(codes, vec!["a", "b", "backup-cheap"]);
    }

    #[test]
    fn price_ties_use_provider_priority() {
        let mut second = option("second", 1_000, 0, 0, false);
        second.priority = 2;
        let mut options = vec![second, option("first", 1_000, 0, 0, false)];
        order_options(&mut options, TransactionType::Prepaid);
        assert_eq!(options[0].provider_code, "first");
    }

    #[test]
    fn postpaid_orders_by_effective_admin() {
        let mut options = vec![
            option("high", 0, 3_000, 500, false),
            option("low", 0, 2_500, 1_000, false),
            option("backup", 0, 1_000, 1_000, true),
        ];
        order_options(&mut options, TransactionType::Payment);
        let codes: Vec<&str> = options.iter().map(|o| o.provider_code.as_str()).collect();
        assert_eq!(codes, vec!["low", "high", "backup"]);
    }

    /// Answers each call with the next scripted rc; `None` is a transport error.
    struct Scripted {
        code: String,
        script: Mutex<Vec<Option<&'static str>>>,
        seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(code: &str, script: Vec<Option<&'static str>>) -> Arc<Self> {
            Arc::new(Self {
                code: code.to_string(),
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProviderAdapter for Scripted {
        async fn topup(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
            self.seen.lock().unwrap().push(request.ref_id.clone());
            let next = self.script.lock().unwrap().remove(0);
            match next {
                Some(rc) => Ok(ProviderResponse {
                    ref_id: request.ref_id.clone(),
                    rc: rc.to_string(),
                    serial_number: Some(format!("SN-{}", self.code)),
                    ..Default::default()
                }),
                None => Err(ProviderError::Transport {
                    provider: self.code.clone(),
                    message: "connection reset".to_string(),
                }),
            }
        }

        async fn inquiry(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
            self.topup(request).await
        }

        async fn payment(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
            self.topup(request).await
        }

        async fn check_status(&self, query: &StatusQuery) -> ProviderResult<ProviderResponse> {
            Ok(ProviderResponse {
                ref_id: query.ref_id.clone(),
                rc: "03".to_string(),
                ..Default::default()
            })
        }

        async fn price_list(&self, _category: &str) -> ProviderResult<Vec<PriceListItem>> {
            Ok(Vec::new())
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

        fn verify_callback(&self, _: &[u8], _: Option<&str>) -> WebhookVerificationResult {
            WebhookVerificationResult {
                valid: true,
                reason: None,
            }
        }

        fn parse_callback(&self, _: &[u8]) -> ProviderResult<ParsedCallback> {
            Err(ProviderError::UnsupportedOperation {
                provider: self.code.clone(),
                operation: "callback".to_string(),
            })
        }
    }

    fn router(adapters: Vec<Arc<Scripted>>) -> ProviderRouter {
        router_on(Arc::new(MemoryStore::new()), adapters)
    }

    fn router_on(store: Arc<MemoryStore>, adapters: Vec<Arc<Scripted>>) -> ProviderRouter {
        let map: HashMap<String, Arc<dyn ProviderAdapter>> = adapters
            .into_iter()
            .map(|a| (a.code.clone(), a as Arc<dyn ProviderAdapter>))
            .collect();
        ProviderRouter::new(
            map,
            store,
            ProviderHealthRegistry::default(),
            RouterConfig {
                wait_cooldown: Duration::from_millis(1),
                ..RouterConfig::default()
            },
            FixedOffset::east_opt(7 * 3600).unwrap(),
        )
    }

    async fn run(router: &ProviderRouter, options: &[ProviderOption]) -> RouteReport {
        router
            .execute_options(
                TransactionType::Prepaid,
                "081200000001",
                false,
                options,
                RefTokens::sequence("TRX-20260101-000001", 0),
            )
            .await
    }

    #[tokio::test]
    async fn switchable_failures_advance_the_suffix() {
        // "01" is a switch, "00" success in the digiflazz table.
        let a = Scripted::new("a", vec![Some("01")]);
        let b = Scripted::new("b", vec![Some("00")]);
        let r = router(vec![a.clone(), b.clone()]);
        let report = run(&r, &[option("a", 1, 0, 0, false), option("b", 2, 0, 0, false)]).await;

        assert_eq!(report.decision, RouteDecision::Success);
        assert_eq!(report.ref_sequence, 2);
        assert_eq!(a.seen.lock().unwrap().clone(), vec!["TRX-20260101-000001"]);
        assert_eq!(b.seen.lock().unwrap().clone(), vec!["TRX-20260101-000001-1"]);
    }

    #[tokio::test]
    async fn transport_error_replays_same_token_once() {
        let a = Scripted::new("a", vec![None, Some("00")]);
        let r = router(vec![a.clone()]);
        let report = run(&r, &[option("a", 1, 0, 0, false)]).await;

        assert_eq!(report.decision, RouteDecision::Success);
        assert_eq!(
            a.seen.lock().unwrap().clone(),
            vec!["TRX-20260101-000001", "TRX-20260101-000001"]
        );
        assert_eq!(report.ref_sequence, 1);
    }

    #[tokio::test]
    async fn repeated_transport_errors_move_to_next_option() {
        let a = Scripted::new("a", vec![None, None]);
        let b = Scripted::new("b", vec![Some("03")]);
        let r = router(vec![a, b.clone()]);
        let report = run(&r, &[option("a", 1, 0, 0, false), option("b", 2, 0, 0, false)]).await;

        assert_eq!(report.decision, RouteDecision::Pending);
        assert!(report.attempts[0].outcome.is_none());
        assert_eq!(b.seen.lock().unwrap().clone(), vec!["TRX-20260101-000001-1"]);
    }

    #[tokio::test]
    async fn fatal_on_backup_stops_routing() {
        // "40" is fatal.
        let a = Scripted::new("a", vec![Some("01")]);
        let b = Scripted::new("b", vec![Some("40")]);
        let c = Scripted::new("c", vec![Some("00")]);
        let r = router(vec![a, b, c.clone()]);
        let report = run(
            &r,
            &[
                option("a", 1, 0, 0, false),
                option("b", 2, 0, 0, true),
                option("c", 3, 0, 0, true),
            ],
        )
        .await;

        assert_eq!(report.decision, RouteDecision::Failed);
        assert!(c.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_switchable_is_exhausted_but_all_fatal_fails() {
        let r = router(vec![
            Scripted::new("a", vec![Some("01")]),
            Scripted::new("b", vec![Some("01")]),
        ]);
        let report = run(&r, &[option("a", 1, 0, 0, false), option("b", 2, 0, 0, false)]).await;
        assert_eq!(report.decision, RouteDecision::Exhausted);

        let r = router(vec![
            Scripted::new("a", vec![Some("40")]),
            Scripted::new("b", vec![Some("40")]),
        ]);
        let report = run(&r, &[option("a", 1, 0, 0, false), option("b", 2, 0, 0, false)]).await;
        assert_eq!(report.decision, RouteDecision::Failed);
    }

    #[tokio::test]
    async fn wait_retries_same_option_with_next_suffix() {
        // "85" asks the caller to wait.
        let a = Scripted::new("a", vec![Some("85"), Some("00")]);
        let r = router(vec![a.clone()]);
        let report = run(&r, &[option("a", 1, 0, 0, false)]).await;

        assert_eq!(report.decision, RouteDecision::Success);
        assert_eq!(
            a.seen.lock().unwrap().clone(),
            vec!["TRX-20260101-000001", "TRX-20260101-000001-1"]
        );
    }

    #[tokio::test]
    async fn missing_adapters_are_skipped_without_consuming_tokens() {
        let b = Scripted::new("b", vec![Some("00")]);
        let r = router(vec![b.clone()]);
        let report = run(&r, &[option("ghost", 1, 0, 0, false), option("b", 2, 0, 0, false)]).await;

        assert_eq!(report.decision, RouteDecision::Success);
        assert_eq!(b.seen.lock().unwrap().clone(), vec!["TRX-20260101-000001"]);
    }

    #[tokio::test]
    async fn execute_selects_mapped_skus_then_routes_cheapest_first() {
        let store = Arc::new(MemoryStore::new());
        let mapped = [("dear", 5_400, true), ("cheap", 5_100, true), ("off", 4_000, false)];
        for (code, price, is_active) in mapped {
            store
                .add_provider_sku(ProviderSku {
                    id: 0,
                    provider_id: price,
                    provider_code: code.to_string(),
                    product_id: 7,
                    sku_code: format!("{}-tsel5", code),
                    price,
                    admin: 0,
                    commission: 0,
                    is_backup: false,
                    priority: 1,
                    is_active,
                })
                .await;
        }
        let cheap = Scripted::new("cheap", vec![Some("01")]);
        let dear = Scripted::new("dear", vec![Some("00")]);
        let off = Scripted::new("off", vec![Some("00")]);
        let r = router_on(store, vec![cheap.clone(), dear.clone(), off.clone()]);

        let report = r
            .execute(
                7,
                TransactionType::Prepaid,
                "081200000001",
                false,
                RefTokens::sequence("TRX-20260101-000002", 0),
            )
            .await
            .unwrap();

        assert_eq!(report.decision, RouteDecision::Success);
        assert_eq!(cheap.seen.lock().unwrap().clone(), vec!["TRX-20260101-000002"]);
        assert_eq!(dear.seen.lock().unwrap().clone(), vec!["TRX-20260101-000002-1"]);
        assert!(off.seen.lock().unwrap().is_empty());
        assert_eq!(report.last().map(|a| a.option.provider_code.as_str()), Some("dear"));
    }
}
