use crate::services::provider_callback::{CallbackDisposition, ProviderCallbackService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ProviderCallbackSweepConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_size: i64,
}

impl Default for ProviderCallbackSweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            batch_size: 50,
        }
    }
}

impl ProviderCallbackSweepConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("PROVIDER_CALLBACK_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.enabled),
            interval: std::env::var("PROVIDER_CALLBACK_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            batch_size: std::env::var("WORKER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallbackSweepStats {
    pub claimed: usize,
    pub applied: usize,
    pub ignored: usize,
    pub unresolved: usize,
    pub errors: usize,
}

/// Applies stored provider callbacks to their transactions.
pub struct ProviderCallbackSweepWorker {
    service: Arc<ProviderCallbackService>,
    config: ProviderCallbackSweepConfig,
}

impl ProviderCallbackSweepWorker {
    pub fn new(service: Arc<ProviderCallbackService>, config: ProviderCallbackSweepConfig) -> Self {
        Self { service, config }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "provider callback worker started"
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
                            applied = stats.applied,
                            ignored = stats.ignored,
                            unresolved = stats.unresolved,
                            errors = stats.errors,
                            "provider callback cycle complete"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "provider callback cycle failed"),
                    }
                }
            }
        }

        info!("provider callback worker stopped");
    }

    pub async fn run_cycle(
        &self,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> anyhow::Result<CallbackSweepStats> {
        let due = self.service.claim_due(self.config.batch_size).await?;
        let mut stats = CallbackSweepStats {
            claimed: due.len(),
            ..CallbackSweepStats::default()
        };

        for callback in due {
            // Left claimed; the lease runs out and the next sweep retries it.
            if *shutdown_rx.borrow() {
                break;
            }
            match self.service.process(&callback).await {
                Ok(CallbackDisposition::Applied) => stats.applied += 1,
                Ok(CallbackDisposition::Ignored) => stats.ignored += 1,
                Ok(CallbackDisposition::Unresolved(_)) => stats.unresolved += 1,
                Err(e) => {
                    stats.errors += 1;
                    warn!(callback_id = callback.id, ref_id = %callback.ref_id, error = %e, "provider callback processing failed");
                }
            }
        }

        Ok(stats)
    }
}
