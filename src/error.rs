//! Error handling for the gateway's HTTP surface
//!
//! Services keep their own `thiserror` enums. Everything that reaches a
//! handler is converted into [`AppError`], which carries the HTTP status,
//! a stable error code and a message safe to show to API clients.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::error::CacheError;
use crate::payments::error::ProviderError;
use crate::services::provider_callback::IngestError;
use crate::services::transaction_engine::EngineError;

/// Error codes for programmatic handling by API clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "TRANSACTION_NOT_FOUND")]
    TransactionNotFound,
    #[serde(rename = "PRODUCT_NOT_FOUND")]
    ProductNotFound,
    #[serde(rename = "PRODUCT_UNAVAILABLE")]
    ProductUnavailable,
    #[serde(rename = "INQUIRY_NOT_FOUND")]
    InquiryNotFound,
    #[serde(rename = "INQUIRY_MISMATCH")]
    InquiryMismatch,
    #[serde(rename = "INQUIRY_EXPIRED")]
    InquiryExpired,
    #[serde(rename = "UNKNOWN_PROVIDER")]
    UnknownProvider,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CACHE_ERROR")]
    CacheError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 504)
    #[serde(rename = "PROVIDER_ERROR")]
    ProviderError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    TransactionNotFound { transaction_id: String },
    ProductNotFound { product_code: String },
    /// Inactive product, or no provider currently sells it
    ProductUnavailable { product_code: String },
    InquiryNotFound { reference: String },
    /// A payment whose customer, product or reference differs from its inquiry
    InquiryMismatch { inquiry_id: String, field: String },
    InquiryExpired { inquiry_id: String },
    UnknownProvider { provider: String },
    InvalidSignature { reason: String },
    /// Missing, unknown or inactive `X-Client-Id`
    UnknownClient { client_id: String },
}

/// Infrastructure-level errors (database, cache, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Cache { message: String },
    Configuration { message: String },
}

/// Upstream provider errors that surface synchronously
#[derive(Debug, Clone)]
pub enum ExternalError {
    Provider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    MissingField { field: String },
    InvalidField { field: String, reason: String },
    InvalidRequest { reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidRequest {
            reason: reason.into(),
        }))
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { .. } => 404,
                DomainError::ProductNotFound { .. } => 404,
                DomainError::ProductUnavailable { .. } => 422,
                DomainError::InquiryNotFound { .. } => 404,
                DomainError::InquiryMismatch { .. } => 422,
                DomainError::InquiryExpired { .. } => 410, // Gone
                DomainError::UnknownProvider { .. } => 404,
                DomainError::InvalidSignature { .. } => 401,
                DomainError::UnknownClient { .. } => 401,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::Provider { .. } => 502, // Bad Gateway
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
                DomainError::ProductNotFound { .. } => ErrorCode::ProductNotFound,
                DomainError::ProductUnavailable { .. } => ErrorCode::ProductUnavailable,
                DomainError::InquiryNotFound { .. } => ErrorCode::InquiryNotFound,
                DomainError::InquiryMismatch { .. } => ErrorCode::InquiryMismatch,
                DomainError::InquiryExpired { .. } => ErrorCode::InquiryExpired,
                DomainError::UnknownProvider { .. } => ErrorCode::UnknownProvider,
                DomainError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
                DomainError::UnknownClient { .. } => ErrorCode::Unauthorized,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::Provider { .. } => ErrorCode::ProviderError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { transaction_id } => {
                    format!("Transaction '{}' not found", transaction_id)
                }
                DomainError::ProductNotFound { product_code } => {
                    format!("Product '{}' not found", product_code)
                }
                DomainError::ProductUnavailable { product_code } => {
                    format!("Product '{}' is currently unavailable", product_code)
                }
                DomainError::InquiryNotFound { reference } => {
                    format!("No open inquiry found for '{}'", reference)
                }
                DomainError::InquiryMismatch { inquiry_id, field } => {
                    format!(
                        "Payment does not match inquiry '{}': {} differs",
                        inquiry_id, field
                    )
                }
                DomainError::InquiryExpired { inquiry_id } => {
                    format!(
                        "Inquiry '{}' has expired. Please request a new inquiry",
                        inquiry_id
                    )
                }
                DomainError::UnknownProvider { provider } => {
                    format!("Unknown provider '{}'", provider)
                }
                DomainError::InvalidSignature { .. } => "Invalid signature".to_string(),
                DomainError::UnknownClient { .. } => {
                    "Missing or unknown X-Client-Id".to_string()
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::Provider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Provider request failed. Please contact support".to_string()
                    }
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::InvalidRequest { reason } => reason.clone(),
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::Provider { is_retryable, .. } => *is_retryable,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// Conversions from specific error types
// Note: From<DatabaseError> is implemented in database/error.rs

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Cache {
            message: err.to_string(),
        }))
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        let kind = match err {
            ProviderError::Timeout {
                provider,
                timeout_secs,
            } => AppErrorKind::External(ExternalError::Timeout {
                service: provider,
                timeout_secs,
            }),
            ProviderError::Configuration { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Configuration { message })
            }
            ProviderError::InvalidSignature { message } => {
                AppErrorKind::Domain(DomainError::InvalidSignature { reason: message })
            }
            other => {
                let is_retryable = other.is_transport();
                AppErrorKind::External(ExternalError::Provider {
                    provider: other.provider().unwrap_or("unknown").to_string(),
                    message: other.to_string(),
                    is_retryable,
                })
            }
        };
        AppError::new(kind)
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let kind = match err {
            EngineError::Validation(reason) => {
                AppErrorKind::Validation(ValidationError::InvalidRequest { reason })
            }
            EngineError::NotFound { entity, id } => AppErrorKind::Domain(match entity {
                "product" => DomainError::ProductNotFound { product_code: id },
                "inquiry" => DomainError::InquiryNotFound { reference: id },
                _ => DomainError::TransactionNotFound { transaction_id: id },
            }),
            EngineError::InquiryMismatch { inquiry_id, field } => {
                AppErrorKind::Domain(DomainError::InquiryMismatch {
                    inquiry_id,
                    field: field.to_string(),
                })
            }
            EngineError::InquiryExpired(inquiry_id) => {
                AppErrorKind::Domain(DomainError::InquiryExpired { inquiry_id })
            }
            EngineError::ProductUnavailable(product_code) => {
                AppErrorKind::Domain(DomainError::ProductUnavailable { product_code })
            }
            EngineError::Database(e) => return e.into(),
            EngineError::Cache(e) => return e.into(),
        };
        AppError::new(kind)
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::UnknownProvider(provider) => {
                AppError::new(AppErrorKind::Domain(DomainError::UnknownProvider { provider }))
            }
            IngestError::InvalidSignature(reason) => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidSignature { reason }))
            }
            IngestError::Parse(e) => AppError::validation(e.to_string()),
            IngestError::Database(e) => e.into(),
        }
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
