use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use tracing::{info, warn};

use super::ApiState;
use crate::error::{AppError, AppResult};
use crate::middleware::error::get_request_id_from_headers;

/// POST /webhooks/{provider}
///
/// Verifies and stores the callback; the provider callback worker applies it.
pub async fn handle_webhook(
    State(state): State<ApiState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let provider = provider.to_lowercase();
    info!(provider = %provider, bytes = body.len(), "provider webhook received");

    let signature = state
        .provider_callbacks
        .signature_header(&provider)
        .and_then(|name| headers.get(name))
        .and_then(|v| v.to_str().ok());

    let stored = state
        .provider_callbacks
        .ingest(&provider, &body, signature)
        .await
        .map_err(|e| {
            warn!(provider = %provider, error = %e, "provider webhook rejected");
            let err = AppError::from(e);
            match get_request_id_from_headers(&headers) {
                Some(id) => err.with_request_id(id),
                None => err,
            }
        })?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "id": stored.id })),
    ))
}
