//! Centralized error handling for ParcelVault
//!
//! `EngineError` is the orchestrator's outcome taxonomy. `ApiError` maps it
//! onto HTTP status codes and JSON error bodies.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::loan::TransitionError;
use crate::settlement::TxRef;
use crate::store::StoreError;

/// Everything an operator needs to reconcile an external effect that has no
/// matching local write
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationDetail {
    /// Handed to the end user; joins the user report to the operator log
    pub reference: Uuid,
    pub loan_id: Uuid,
    pub operation: &'static str,
    pub tx_ref: Option<TxRef>,
    pub custody_token: Option<String>,
    pub cause: String,
}

/// Settlement engine outcomes other than success
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),

    /// Precondition failed; no external effect occurred
    #[error("rejected: {0}")]
    Rejected(String),

    /// Lost a race to a concurrent transition
    #[error("stale state: {0}")]
    StaleState(String),

    /// External confirmation not yet terminal; custody was not left locked
    #[error("settlement {tx_ref} is still pending")]
    Pending { tx_ref: TxRef, retry_after: Duration },

    #[error("settlement {tx_ref} moved {actual} instead of {expected}: {reason}")]
    MismatchedAmount {
        tx_ref: TxRef,
        expected: f64,
        actual: f64,
        reason: String,
    },

    #[error("custody operation failed: {0}")]
    CustodyFailed(String),

    #[error("settlement network unavailable: {0}")]
    SettlementUnavailable(String),

    /// External effect committed, local write did not. Never retried.
    #[error("external success without local commit for loan {}: {}", .0.loan_id, .0.cause)]
    ExternalSuccessLocalInconsistency(Box<ReconciliationDetail>),

    #[error(transparent)]
    Store(StoreError),
}

impl From<TransitionError> for EngineError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::StaleState { .. } => EngineError::StaleState(err.to_string()),
            TransitionError::Rejected(reason) => EngineError::Rejected(reason),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => EngineError::NotFound(format!("{} {}", entity, id)),
            StoreError::StaleState { .. } | StoreError::AssetChanged { .. } => {
                EngineError::StaleState(err.to_string())
            }
            StoreError::Database(_) => EngineError::Store(err),
        }
    }
}

/// API error type with HTTP status code mapping
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unprocessable entity: {0}")]
    UnprocessableEntity(String),

    #[error("Accepted, settlement still pending: {message}")]
    Pending { message: String, retry_after_secs: u64 },

    #[error("The operation could not be completed. Please contact support with reference {0}")]
    ReconciliationRequired(Uuid),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// JSON error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

/// Error details in the response
#[derive(Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::UnprocessableEntity(_) => "UNPROCESSABLE_ENTITY",
            ApiError::Pending { .. } => "SETTLEMENT_PENDING",
            ApiError::ReconciliationRequired(_) => "CONTACT_SUPPORT",
            ApiError::InternalError(_) => "INTERNAL_ERROR",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::DatabaseError(_) => "DATABASE_ERROR",
            ApiError::ExternalServiceError(_) => "EXTERNAL_SERVICE_ERROR",
            ApiError::ValidationError(_) => "VALIDATION_ERROR",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Pending { .. } => StatusCode::ACCEPTED,
            ApiError::ReconciliationRequired(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        // Log server errors
        match &self {
            ApiError::InternalError(_)
            | ApiError::DatabaseError(_)
            | ApiError::ServiceUnavailable(_)
            | ApiError::ReconciliationRequired(_) => {
                tracing::error!(error = %message, code = %error_code, "Server error occurred");
            }
            _ => {
                tracing::debug!(error = %message, code = %error_code, "Client error occurred");
            }
        }

        let retry_after = match &self {
            ApiError::Pending {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code: error_code.to_string(),
                message,
                details: None,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(what) => ApiError::NotFound(what),
            EngineError::Rejected(reason) => ApiError::UnprocessableEntity(reason),
            EngineError::StaleState(reason) => ApiError::Conflict(reason),
            EngineError::Pending {
                tx_ref,
                retry_after,
            } => ApiError::Pending {
                message: format!(
                    "transfer {} has not settled yet and may still complete; retry with it as payment_reference",
                    tx_ref
                ),
                retry_after_secs: retry_after.as_secs().max(1),
            },
            err @ EngineError::MismatchedAmount { .. } => {
                ApiError::UnprocessableEntity(err.to_string())
            }
            EngineError::CustodyFailed(reason) => ApiError::ExternalServiceError(reason),
            EngineError::SettlementUnavailable(reason) => ApiError::ServiceUnavailable(reason),
            // Detail stays in the operator log written by the engine
            EngineError::ExternalSuccessLocalInconsistency(detail) => {
                ApiError::ReconciliationRequired(detail.reference)
            }
            EngineError::Store(err) => ApiError::DatabaseError(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        EngineError::from(err).into()
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(err.to_string())
    }
}

/// Result type alias using ApiError
pub type ApiResult<T> = Result<T, ApiError>;
