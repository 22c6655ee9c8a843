//! HTTP surface: client transaction API, provider webhooks and health probes.

pub mod providers;
pub mod transactions;
pub mod webhooks;

use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::error;

use crate::database::models::Client;
use crate::database::repository::CatalogStore;
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::health::{HealthChecker, HealthState, HealthStatus};
use crate::middleware::error::get_request_id_from_headers;
use crate::services::provider_callback::ProviderCallbackService;
use crate::services::transaction_engine::TransactionEngine;

pub const CLIENT_ID_HEADER: &str = "x-client-id";

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<TransactionEngine>,
    pub catalog: Arc<dyn CatalogStore>,
    pub provider_callbacks: Arc<ProviderCallbackService>,
    pub health: HealthChecker,
}

/// All routes; request-id and logging layers are added by the binary.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .route("/health/live", get(liveness))
        .route(
            "/api/v1/transactions",
            post(transactions::create_transaction),
        )
        .route(
            "/api/v1/transactions/{transaction_id}",
            get(transactions::get_transaction),
        )
        .route("/api/v1/inquiries", post(transactions::create_inquiry))
        .route("/api/v1/payments", post(transactions::create_payment))
        .route(
            "/api/v1/providers/{provider}/price-list",
            get(providers::price_list),
        )
        .route("/webhooks/{provider}", post(webhooks::handle_webhook))
        .with_state(state)
}

/// The caller, identified by `X-Client-Id` and checked against the catalog.
pub struct AuthenticatedClient(pub Client);

impl FromRequestParts<ApiState> for AuthenticatedClient {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let request_id = get_request_id_from_headers(&parts.headers);
        let raw = parts
            .headers
            .get(CLIENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim()
            .to_string();

        let rejected = |raw: String| {
            let err = AppError::new(AppErrorKind::Domain(DomainError::UnknownClient {
                client_id: raw,
            }));
            match request_id.clone() {
                Some(id) => err.with_request_id(id),
                None => err,
            }
        };

        let Ok(client_id) = raw.parse::<i64>() else {
            return Err(rejected(raw));
        };

        match state.catalog.find_client(client_id).await {
            Ok(Some(client)) if client.is_active => Ok(AuthenticatedClient(client)),
            Ok(_) => Err(rejected(raw)),
            Err(e) => {
                let err: AppError = e.into();
                Err(match request_id {
                    Some(id) => err.with_request_id(id),
                    None => err,
                })
            }
        }
    }
}

async fn root() -> &'static str {
    "PPOB gateway"
}

async fn health(
    State(state): State<ApiState>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let status = state.health.check_health().await;
    if status.status == HealthState::Unhealthy {
        error!("health check failed - service unhealthy");
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(status)))
    } else {
        Ok(Json(status))
    }
}

/// Readiness probe - the gateway can take traffic when its stores answer
async fn readiness(
    state: State<ApiState>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    health(state).await
}

/// Liveness probe - the process is up
async fn liveness() -> &'static str {
    "OK"
}
