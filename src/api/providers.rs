use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use tracing::debug;

use super::{ApiState, AuthenticatedClient};
use crate::error::{AppError, AppErrorKind, AppResult, DomainError};
use crate::payments::types::PriceListItem;

#[derive(Debug, Deserialize)]
pub struct PriceListQuery {
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "prepaid".to_string()
}

/// GET /api/v1/providers/{provider}/price-list?category=prepaid
///
/// Live upstream catalog, used when onboarding SKUs.
pub async fn price_list(
    State(state): State<ApiState>,
    AuthenticatedClient(client): AuthenticatedClient,
    Path(provider): Path<String>,
    Query(query): Query<PriceListQuery>,
) -> AppResult<Json<Vec<PriceListItem>>> {
    let adapter = state
        .engine
        .router()
        .adapter(&provider.to_lowercase())
        .ok_or_else(|| {
            AppError::new(AppErrorKind::Domain(DomainError::UnknownProvider {
                provider: provider.clone(),
            }))
        })?;

    let items = adapter.price_list(&query.category).await?;
    debug!(
        client = %client.code,
        provider = %provider,
        category = %query.category,
        items = items.len(),
        "price list fetched"
    );
    Ok(Json(items))
}
