use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::services::callback::CallbackService;

#[derive(Debug, Clone)]
pub struct WebhookRetryConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_size: i64,
}

impl Default for WebhookRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(15),
            batch_size: 50,
        }
    }
}

impl WebhookRetryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("WEBHOOK_RETRY_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.enabled),
            interval: std::env::var("WEBHOOK_RETRY_INTERVAL_SECS")
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

/// Resends undelivered client webhooks whose retry time has come.
pub struct WebhookRetryWorker {
    service: Arc<CallbackService>,
    config: WebhookRetryConfig,
}

impl WebhookRetryWorker {
    pub fn new(service: Arc<CallbackService>, config: WebhookRetryConfig) -> Self {
        Self { service, config }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "webhook retry worker started"
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
                        Ok(count) if count > 0 => info!(retried = count, "retried pending webhooks"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "webhook retry cycle failed"),
                    }
                }
            }
        }

        info!("webhook retry worker stopped");
    }

    pub async fn run_cycle(&self, shutdown_rx: &watch::Receiver<bool>) -> anyhow::Result<usize> {
        let due = self.service.claim_due(self.config.batch_size).await?;
        let mut retried = 0;
        for log in &due {
            // Unsent logs keep their claimed retry time and come back later.
            if *shutdown_rx.borrow() {
                break;
            }
            match self.service.retry(log).await {
                Ok(_) => retried += 1,
                Err(e) => warn!(callback_log_id = log.id, error = %e, "webhook retry failed"),
            }
        }
        Ok(retried)
    }
}
