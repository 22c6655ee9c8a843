use crate::database::repository::TransactionStore;
use crate::services::transaction_engine::{to_chrono, TransactionEngine};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetrySweepConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_size: i64,
    pub claim_lease: Duration,
}

impl Default for RetrySweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            batch_size: 50,
            claim_lease: Duration::from_secs(120),
        }
    }
}

impl RetrySweepConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("RETRY_SWEEP_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.enabled),
            interval: std::env::var("RETRY_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
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

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub claimed: usize,
    pub redriven: usize,
    pub expired: usize,
    pub errors: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Routes parked transactions again once `next_retry_at` is due, and fails
/// the ones that outlived `expired_at`.
pub struct RetrySweepWorker {
    engine: Arc<TransactionEngine>,
    transactions: Arc<dyn TransactionStore>,
    config: RetrySweepConfig,
}

impl RetrySweepWorker {
    pub fn new(
        engine: Arc<TransactionEngine>,
        transactions: Arc<dyn TransactionStore>,
        config: RetrySweepConfig,
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
            batch_size = self.config.batch_size,
            "retry sweep worker started"
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
                            redriven = stats.redriven,
                            expired = stats.expired,
                            errors = stats.errors,
                            "retry sweep cycle complete"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "retry sweep cycle failed"),
                    }
                }
            }
        }

        info!("retry sweep worker stopped");
    }

    /// One sweep. Stops between items once shutdown is signalled.
    pub async fn run_cycle(&self, shutdown_rx: &watch::Receiver<bool>) -> anyhow::Result<SweepStats> {
        let now = Utc::now();
        let due = self
            .transactions
            .claim_due_retries(now, now + to_chrono(self.config.claim_lease), self.config.batch_size)
            .await?;

        let mut stats = SweepStats {
            claimed: due.len(),
            ..SweepStats::default()
        };

        for tx in due {
            if *shutdown_rx.borrow() {
                // Unclaim the rest so another instance can pick them up.
                if let Err(e) = self.transactions.release_claim(tx.id).await {
                    warn!(transaction_id = %tx.transaction_id, error = %e, "failed to release claim");
                }
                continue;
            }

            let expired = tx.expired_at.is_some_and(|at| at <= Utc::now());
            let result = if expired {
                self.engine
                    .force_fail(&tx, "transaction expired before resolution", "TIMEOUT")
                    .await
            } else {
                self.engine.redrive(&tx).await
            };

            match result {
                Ok(_) if expired => stats.expired += 1,
                Ok(_) => stats.redriven += 1,
                Err(e) => {
                    stats.errors += 1;
                    warn!(transaction_id = %tx.transaction_id, error = %e, "retry sweep item failed");
                }
            }
        }

        Ok(stats)
    }
}
