//! Outbound webhooks to clients.
//!
//! Each `(transaction, event)` pair gets one `CallbackLog` row holding the
//! exact payload bytes. The first send happens right after the state change;
//! later attempts re-sign and resend the stored bytes on a fixed schedule.

use crate::database::error::DatabaseError;
use crate::database::models::{
    CallbackAttempt, CallbackEvent, CallbackLog, NewCallbackLog, Transaction,
};
use crate::database::repository::{CallbackLogStore, CatalogStore, TransactionStore};
use crate::payments::utils::hmac_sha256_hex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Delay after a failed attempt, indexed by attempt number minus one.
pub const RETRY_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(2 * 60 * 60),
];

/// Delay before the next attempt after `attempt` failed. `None` once the
/// schedule is used up: the log then stays undelivered for good.
pub fn retry_delay(attempt: i32) -> Option<Duration> {
    if attempt < 1 {
        return None;
    }
    RETRY_SCHEDULE.get((attempt - 1) as usize).copied()
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback transport error: {0}")]
    Transport(String),
    #[error("callback payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub timeout: Duration,
    pub max_in_flight: usize,
    /// How long a claimed log stays invisible to other retry sweeps.
    pub claim_lease: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_in_flight: 64,
            claim_lease: Duration::from_secs(120),
        }
    }
}

impl CallbackConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: std::env::var("CALLBACK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_in_flight: std::env::var("CALLBACK_MAX_IN_FLIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_in_flight),
            claim_lease: std::env::var("CLAIM_LEASE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_lease),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CallbackPayload {
    pub event: CallbackEvent,
    pub transaction_id: String,
    pub reference_id: String,
    #[serde(rename = "type")]
    pub transaction_type: String,
    pub status: String,
    pub product_code: String,
    pub customer_no: String,
    pub customer_name: Option<String>,
    pub serial_number: Option<String>,
    pub amount: i64,
    pub admin: i64,
    pub price: i64,
    pub failed_reason: Option<String>,
    pub failed_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl CallbackPayload {
    pub fn from_transaction(tx: &Transaction, event: CallbackEvent, now: DateTime<Utc>) -> Self {
        Self {
            event,
            transaction_id: tx.transaction_id.clone(),
            reference_id: tx.reference_id.clone(),
            transaction_type: tx.r#type.as_str().to_string(),
            status: tx.status.as_str().to_string(),
            product_code: tx.product_code.clone(),
            customer_no: tx.customer_no.clone(),
            customer_name: tx.customer_name.clone(),
            serial_number: tx.serial_number.clone(),
            amount: tx.amount,
            admin: tx.admin,
            price: tx.sell_price,
            failed_reason: tx.failed_reason.clone(),
            failed_code: tx.failed_code.clone(),
            created_at: tx.created_at,
            processed_at: tx.processed_at,
            timestamp: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackHeaders {
    pub signature: String,
    pub event: String,
    pub timestamp: i64,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait CallbackTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &CallbackHeaders,
        body: &[u8],
    ) -> Result<TransportResponse, CallbackError>;
}

pub struct HttpCallbackTransport {
    client: reqwest::Client,
}

impl HttpCallbackTransport {
    pub fn new(timeout: Duration) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallbackError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CallbackTransport for HttpCallbackTransport {
    async fn post(
        &self,
        url: &str,
        headers: &CallbackHeaders,
        body: &[u8],
    ) -> Result<TransportResponse, CallbackError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Signature", &headers.signature)
            .header("X-Event", &headers.event)
            .header("X-Timestamp", headers.timestamp.to_string())
            .header("X-Request-Id", &headers.request_id)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| CallbackError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        // Response bodies are kept for the audit log only.
        let body = response.text().await.unwrap_or_default();
        Ok(TransportResponse { status, body })
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

const MAX_STORED_RESPONSE: usize = 2048;

pub struct CallbackService {
    transactions: Arc<dyn TransactionStore>,
    logs: Arc<dyn CallbackLogStore>,
    catalog: Arc<dyn CatalogStore>,
    transport: Arc<dyn CallbackTransport>,
    config: CallbackConfig,
}

impl CallbackService {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        logs: Arc<dyn CallbackLogStore>,
        catalog: Arc<dyn CatalogStore>,
        transport: Arc<dyn CallbackTransport>,
        config: CallbackConfig,
    ) -> Self {
        Self {
            transactions,
            logs,
            catalog,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &CallbackConfig {
        &self.config
    }

    /// First delivery of `event` for `tx`. Returns `None` when the client
    /// has no callback URL or the event was already logged.
    pub async fn send_callback(
        &self,
        tx: &Transaction,
        event: CallbackEvent,
    ) -> Result<Option<CallbackLog>, CallbackError> {
        let Some(client) = self.catalog.find_client(tx.client_id).await? else {
            warn!(transaction_id = %tx.transaction_id, client_id = tx.client_id, "callback skipped, unknown client");
            return Ok(None);
        };
        let Some(url) = client.callback_url.filter(|u| !u.is_empty()) else {
            debug!(transaction_id = %tx.transaction_id, "callback skipped, no callback url");
            return Ok(None);
        };

        let now = Utc::now();
        let payload = serde_json::to_string(&CallbackPayload::from_transaction(tx, event, now))?;
        let inserted = self
            .logs
            .insert(NewCallbackLog {
                transaction_id: tx.transaction_id.clone(),
                client_id: tx.client_id,
                event,
                url,
                payload,
                next_retry_at: retry_delay(1).map(|d| now + to_chrono(d)),
            })
            .await?;

        let Some(log) = inserted else {
            debug!(transaction_id = %tx.transaction_id, event = %event, "callback already logged");
            return Ok(None);
        };

        let log = self.deliver(&log, &client.callback_secret, 1).await?;
        Ok(Some(log))
    }

    /// Claims due logs for a retry sweep.
    pub async fn claim_due(&self, limit: i64) -> Result<Vec<CallbackLog>, CallbackError> {
        let now = Utc::now();
        Ok(self
            .logs
            .claim_due(now, now + to_chrono(self.config.claim_lease), limit)
            .await?)
    }

    /// Resends the stored payload as the next attempt.
    pub async fn retry(&self, log: &CallbackLog) -> Result<CallbackLog, CallbackError> {
        let secret = match self.catalog.find_client(log.client_id).await? {
            Some(client) => client.callback_secret,
            None => {
                warn!(callback_log_id = log.id, "client vanished, retrying unsigned");
                String::new()
            }
        };
        self.deliver(log, &secret, log.attempt + 1).await
    }

    async fn deliver(
        &self,
        log: &CallbackLog,
        secret: &str,
        attempt: i32,
    ) -> Result<CallbackLog, CallbackError> {
        let now = Utc::now();
        let headers = CallbackHeaders {
            signature: format!("sha256={}", hmac_sha256_hex(secret, log.payload.as_bytes())),
            event: log.event.as_str().to_string(),
            timestamp: now.timestamp(),
            request_id: Uuid::new_v4().to_string(),
        };

        let (http_status, response_body) = match self
            .transport
            .post(&log.url, &headers, log.payload.as_bytes())
            .await
        {
            Ok(response) => (Some(response.status as i32), Some(truncate(response.body))),
            Err(e) => (None, Some(e.to_string())),
        };

        let delivered = http_status == Some(200);
        let next_retry_at = if delivered {
            None
        } else {
            retry_delay(attempt).map(|d| now + to_chrono(d))
        };

        let updated = self
            .logs
            .record_attempt(
                log.id,
                CallbackAttempt {
                    attempt,
                    http_status,
                    response_body,
                    delivered,
                    next_retry_at,
                    at: now,
                },
            )
            .await?;

        if delivered {
            if let Some(tx) = self
                .transactions
                .find_by_transaction_id(&log.transaction_id)
                .await?
            {
                self.transactions.mark_callback_sent(tx.id, now).await?;
            }
            info!(
                transaction_id = %log.transaction_id,
                event = %log.event,
                attempt,
                "callback delivered"
            );
        } else {
            warn!(
                transaction_id = %log.transaction_id,
                event = %log.event,
                attempt,
                http_status = ?http_status,
                next_retry_at = ?next_retry_at,
                "callback not delivered"
            );
        }

        Ok(updated)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_STORED_RESPONSE {
        let mut end = MAX_STORED_RESPONSE;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Runs first deliveries in the background so the caller never waits on the
/// client's HTTP endpoint. Sends are tracked so shutdown can drain them.
#[derive(Clone)]
pub struct CallbackDispatcher {
    service: Arc<CallbackService>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    permits: Arc<Semaphore>,
}

impl CallbackDispatcher {
    pub fn new(service: Arc<CallbackService>) -> Self {
        let max_in_flight = service.config().max_in_flight.max(1);
        Self {
            service,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            permits: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    pub fn service(&self) -> &Arc<CallbackService> {
        &self.service
    }

    /// Waits only for a free slot, never for the delivery itself.
    pub async fn dispatch(&self, tx: Transaction, event: CallbackEvent) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(transaction_id = %tx.transaction_id, "dispatcher closed, callback left to retry sweep");
                return;
            }
        };

        let service = self.service.clone();
        let mut tasks = self.tasks.lock().await;
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                error!(error = %e, "callback task panicked");
            }
        }
        tasks.spawn(async move {
            if let Err(e) = service.send_callback(&tx, event).await {
                error!(transaction_id = %tx.transaction_id, event = %event, error = %e, "callback dispatch failed");
            }
            drop(permit);
        });
    }

    pub async fn in_flight(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Awaits every dispatched send.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "callback task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_schedule_follows_fixed_intervals() {
        let expected = [30, 60, 300, 1_800, 7_200];
        for (i, secs) in expected.iter().enumerate() {
            assert_eq!(retry_delay(i as i32 + 1), Some(Duration::from_secs(*secs)));
        }
        assert_eq!(retry_delay(6), None);
        assert_eq!(retry_delay(0), None);
    }

    #[test]
    fn long_response_bodies_are_truncated() {
        let body = "x".repeat(MAX_STORED_RESPONSE + 10);
        assert_eq!(truncate(body).len(), MAX_STORED_RESPONSE);
        assert_eq!(truncate("ok".to_string()), "ok");
    }

    #[tokio::test]
    async fn http_transport_sends_signature_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_header("x-signature", "sha256=abc")
            .match_header("x-event", "transaction.success")
            .match_header("x-timestamp", "1767225600")
            .match_header("x-request-id", "req-1")
            .match_body(r#"{"a":1}"#)
            .with_status(200)
            .with_body("OK")
            .create_async()
            .await;

        let transport = HttpCallbackTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .post(
                &format!("{}/hook", server.url()),
                &CallbackHeaders {
                    signature: "sha256=abc".to_string(),
                    event: "transaction.success".to_string(),
                    timestamp: 1_767_225_600,
                    request_id: "req-1".to_string(),
                },
                br#"{"a":1}"#,
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "OK");
        mock.assert_async().await;
    }
}
