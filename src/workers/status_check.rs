use crate::database::models::Transaction;
use crate::database::repository::TransactionStore;
use crate::payments::types::StatusQuery;
use crate::services::transaction_engine::{is_past_max_age, to_chrono, TransactionEngine};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StatusCheckConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Rows untouched for this long are polled.
    pub stale_after: Duration,
    pub batch_size: i64,
    pub claim_lease: Duration,
}

impl Default for StatusCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(5 * 60),
            batch_size: 50,
            claim_lease: Duration::from_secs(120),
        }
    }
}

impl StatusCheckConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("STATUS_CHECK_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.enabled),
            interval: std::env::var("STATUS_CHECK_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            stale_after: std::env::var("STALE_PROCESSING_MINUTES")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(defaults.stale_after),
            batch_size: std::env::var("WORKER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            claim_lease: std::env::var("CLAIM_LEASE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_lease),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// The provider answered and the answer was applied.
    Resolved,
    StillPending,
    TimedOut,
    /// No attempt was ever recorded; handed to the retry sweep.
    Parked,
    Skipped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckStats {
    pub claimed: usize,
    pub resolved: usize,
    pub pending: usize,
    pub timed_out: usize,
    pub errors: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Polls the owning provider for transactions that stopped moving.
pub struct StatusCheckWorker {
    engine: Arc<TransactionEngine>,
    transactions: Arc<dyn TransactionStore>,
    config: StatusCheckConfig,
}

impl StatusCheckWorker {
    pub fn new(
        engine: Arc<TransactionEngine>,
        transactions: Arc<dyn TransactionStore>,
        config: StatusCheckConfig,
    ) -> Self {
        Self {
            engine,
            transactions,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "status check worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_cycle(&shutdown_rx).await {
                        Ok(stats) if stats.claimed > 0 => info!(
                            claimed = stats.claimed,
                            resolved = stats.resolved,
                            pending = stats.pending,
                            timed_out = stats.timed_out,
                            errors = stats.errors,
                            "status check cycle complete"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "status check cycle failed"),
                    }
                }
            }
        }

        info!("status check worker stopped");
    }

    pub async fn run_cycle(&self, shutdown_rx: &watch::Receiver<bool>) -> anyhow::Result<CheckStats> {
        let now = Utc::now();
        let stale = self
            .transactions
            .claim_stale(
                now - to_chrono(self.config.stale_after),
                now,
                now + to_chrono(self.config.claim_lease),
                self.config.batch_size,
            )
            .await?;

        let mut stats = CheckStats {
            claimed: stale.len(),
            ..CheckStats::default()
        };

        for tx in stale {
            if *shutdown_rx.borrow() {
                if let Err(e) = self.transactions.release_claim(tx.id).await {
                    warn!(transaction_id = %tx.transaction_id, error = %e, "failed to release claim");
                }
                continue;
            }

            match self.check(&tx).await {
                Ok(CheckResult::Resolved) => stats.resolved += 1,
                Ok(CheckResult::TimedOut) => stats.timed_out += 1,
                Ok(CheckResult::StillPending | CheckResult::Parked | CheckResult::Skipped) => {
                    stats.pending += 1
                }
                Err(e) => {
                    stats.errors += 1;
                    warn!(transaction_id = %tx.transaction_id, error = %e, "status check item failed");
                }
            }
        }

        Ok(stats)
    }

    /// Asks the provider first; only an unresolved transaction past the
    /// maximum age is timed out.
    pub async fn check(&self, tx: &Transaction) -> anyhow::Result<CheckResult> {
        let past_max_age = is_past_max_age(tx, self.engine.config().max_age, Utc::now());

        let (Some(provider_code), Some(ref_id)) = (&tx.provider_code, &tx.provider_ref_id) else {
            if past_max_age {
                return self.time_out(tx).await;
            }
            debug!(transaction_id = %tx.transaction_id, "no provider attempt recorded, parking");
            self.engine.park_for_retry(tx).await?;
            return Ok(CheckResult::Parked);
        };

        let router = self.engine.router();
        let Some(adapter) = router.adapter(provider_code) else {
            warn!(transaction_id = %tx.transaction_id, provider = %provider_code, "no adapter for status check");
            if past_max_age {
                return self.time_out(tx).await;
            }
            return Ok(CheckResult::Skipped);
        };

        let query = StatusQuery {
            ref_id: ref_id.clone(),
            transaction_type: tx.r#type,
            sku_code: tx.provider_sku_code.clone().unwrap_or_default(),
            customer_no: tx.customer_no.clone(),
            sandbox: tx.is_sandbox,
        };

        match adapter.check_status(&query).await {
            Ok(response) => {
                let outcome = adapter.classify(&response.rc);
                debug!(
                    transaction_id = %tx.transaction_id,
                    provider = %provider_code,
                    ref_id = %ref_id,
                    rc = %response.rc,
                    outcome = %outcome,
                    "status check answered"
                );
                if outcome.is_decisive() || outcome.is_retryable() {
                    self.engine.apply_provider_result(tx, outcome, &response).await?;
                    return Ok(CheckResult::Resolved);
                }
            }
            Err(e) => {
                warn!(
                    transaction_id = %tx.transaction_id,
                    provider = %provider_code,
                    error = %e,
                    "status check failed"
                );
            }
        }

        if past_max_age {
            return self.time_out(tx).await;
        }
        Ok(CheckResult::StillPending)
    }

    async fn time_out(&self, tx: &Transaction) -> anyhow::Result<CheckResult> {
        self.engine
            .force_fail(tx, "no provider resolution before maximum age", "TIMEOUT")
            .await?;
        Ok(CheckResult::TimedOut)
    }
}
