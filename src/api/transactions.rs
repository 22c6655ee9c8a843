//! Client transaction API: prepaid purchases, bill inquiries and payments.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use super::{ApiState, AuthenticatedClient};
use crate::cache::inquiry::CachedInquiry;
use crate::database::models::{Transaction, TransactionStatus};
use crate::error::{AppError, AppResult};
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::types::TransactionType;
use crate::services::provider_router::RouteDecision;
use crate::services::transaction_engine::{
    Accepted, CreateTransactionRequest, InquiryOutcome, InquiryRequest, PaymentRequest,
};

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateTransactionBody {
    pub reference_id: String,
    pub product_code: String,
    pub customer_no: String,
    #[serde(default)]
    pub is_sandbox: bool,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct InquiryBody {
    pub reference_id: String,
    pub product_code: String,
    pub customer_no: String,
    #[serde(default)]
    pub is_sandbox: bool,
}

#[derive(Debug, Deserialize)]
pub struct PaymentBody {
    pub reference_id: String,
    pub product_code: String,
    pub customer_no: String,
    #[serde(default)]
    pub inquiry_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub transaction_id: String,
    pub reference_id: String,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub product_code: String,
    pub customer_no: String,
    pub customer_name: Option<String>,
    pub serial_number: Option<String>,
    pub inquiry_id: Option<String>,
    pub amount: i64,
    pub admin: i64,
    pub price: i64,
    pub failed_code: Option<String>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<&Transaction> for TransactionResponse {
    fn from(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.transaction_id.clone(),
            reference_id: tx.reference_id.clone(),
            transaction_type: tx.r#type,
            status: tx.status,
            product_code: tx.product_code.clone(),
            customer_no: tx.customer_no.clone(),
            customer_name: tx.customer_name.clone(),
            serial_number: tx.serial_number.clone(),
            inquiry_id: tx.inquiry_id.clone(),
            amount: tx.amount,
            admin: tx.admin,
            price: tx.sell_price,
            failed_code: tx.failed_code.clone(),
            failed_reason: tx.failed_reason.clone(),
            created_at: tx.created_at,
            updated_at: tx.updated_at,
            processed_at: tx.processed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InquiryResponse {
    pub inquiry_id: String,
    pub reference_id: String,
    pub product_code: String,
    pub customer_no: String,
    pub customer_name: Option<String>,
    pub amount: i64,
    pub admin: i64,
    /// What the client will be charged on payment.
    pub total: i64,
    pub expires_at: DateTime<Utc>,
}

impl From<&CachedInquiry> for InquiryResponse {
    fn from(inquiry: &CachedInquiry) -> Self {
        Self {
            inquiry_id: inquiry.transaction_id.clone(),
            reference_id: inquiry.reference_id.clone(),
            product_code: inquiry.product_code.clone(),
            customer_no: inquiry.customer_no.clone(),
            customer_name: inquiry.customer_name.clone(),
            amount: inquiry.amount,
            admin: inquiry.admin,
            total: inquiry.sell_price,
            expires_at: inquiry.expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InquiryRejectedResponse {
    pub status: String,
    pub rc: Option<String>,
    pub message: String,
    pub retryable: bool,
}

/// 201 for a fresh transaction, 200 when the reference was already known.
fn accepted_response(accepted: Accepted) -> Response {
    let status = if accepted.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(TransactionResponse::from(&accepted.transaction))).into_response()
}

fn tag(headers: &HeaderMap) -> impl Fn(AppError) -> AppError + '_ {
    move |err| match get_request_id_from_headers(headers) {
        Some(id) => err.with_request_id(id),
        None => err,
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/transactions
pub async fn create_transaction(
    State(state): State<ApiState>,
    AuthenticatedClient(client): AuthenticatedClient,
    headers: HeaderMap,
    Json(body): Json<CreateTransactionBody>,
) -> AppResult<Response> {
    let accepted = state
        .engine
        .create_transaction(CreateTransactionRequest {
            client_id: client.id,
            reference_id: body.reference_id,
            product_code: body.product_code,
            customer_no: body.customer_no,
            is_sandbox: body.is_sandbox,
            metadata: body.metadata,
        })
        .await
        .map_err(AppError::from)
        .map_err(tag(&headers))?;

    info!(
        client = %client.code,
        transaction_id = %accepted.transaction.transaction_id,
        status = ?accepted.transaction.status,
        duplicate = accepted.duplicate,
        "prepaid request handled"
    );
    Ok(accepted_response(accepted))
}

/// POST /api/v1/inquiries
pub async fn create_inquiry(
    State(state): State<ApiState>,
    AuthenticatedClient(client): AuthenticatedClient,
    headers: HeaderMap,
    Json(body): Json<InquiryBody>,
) -> AppResult<Response> {
    let outcome = state
        .engine
        .inquiry(InquiryRequest {
            client_id: client.id,
            reference_id: body.reference_id,
            product_code: body.product_code,
            customer_no: body.customer_no,
            is_sandbox: body.is_sandbox,
        })
        .await
        .map_err(AppError::from)
        .map_err(tag(&headers))?;

    Ok(match outcome {
        InquiryOutcome::Ready(inquiry) => {
            (StatusCode::OK, Json(InquiryResponse::from(&inquiry))).into_response()
        }
        InquiryOutcome::Rejected {
            rc,
            message,
            decision,
        } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(InquiryRejectedResponse {
                status: "failed".to_string(),
                rc,
                message,
                retryable: decision == RouteDecision::Exhausted,
            }),
        )
            .into_response(),
    })
}

/// POST /api/v1/payments
pub async fn create_payment(
    State(state): State<ApiState>,
    AuthenticatedClient(client): AuthenticatedClient,
    headers: HeaderMap,
    Json(body): Json<PaymentBody>,
) -> AppResult<Response> {
    let accepted = state
        .engine
        .pay(PaymentRequest {
            client_id: client.id,
            reference_id: body.reference_id,
            product_code: body.product_code,
            customer_no: body.customer_no,
            inquiry_id: body.inquiry_id,
            metadata: body.metadata,
        })
        .await
        .map_err(AppError::from)
        .map_err(tag(&headers))?;

    Ok(accepted_response(accepted))
}

/// GET /api/v1/transactions/{transaction_id}
pub async fn get_transaction(
    State(state): State<ApiState>,
    AuthenticatedClient(client): AuthenticatedClient,
    headers: HeaderMap,
    Path(transaction_id): Path<String>,
) -> AppResult<Json<TransactionResponse>> {
    let tx = state
        .engine
        .get_transaction(client.id, &transaction_id)
        .await
        .map_err(AppError::from)
        .map_err(tag(&headers))?;
    Ok(Json(TransactionResponse::from(&tx)))
}
