//! Gateway error taxonomy
//!
//! [`GatewayError`] is what the notification path reasons about; it decides
//! how a provider delivery is acknowledged. [`AppError`] is the HTTP-facing
//! error of the internal RPC surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::database::StoreError;
use crate::payments::{AckOutcome, ProviderError};
use crate::services::transition::TransitionError;
use crate::workers::reconciliation::ReconciliationError;

// ============================================================================
// Gateway errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("ignored event: {0}")]
    IgnoredEvent(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The transition was already applied by an earlier delivery
    #[error("event already processed")]
    AlreadyProcessed,

    /// Another worker holds the dedup lock for this event
    #[error("event is being processed by another worker")]
    LockContention,

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("unknown order: {0}")]
    UnknownOrder(String),

    #[error("event rejected: {0}")]
    RejectedEvent(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// How the provider should treat the delivery that produced this error.
    ///
    /// Only authenticity/parse failures and our own transient failures are
    /// non-2xx; everything else is acknowledged so providers stop redelivering.
    pub fn ack_outcome(&self) -> AckOutcome {
        match self {
            GatewayError::InvalidSignature(_)
            | GatewayError::MalformedPayload(_)
            | GatewayError::Configuration(_) => AckOutcome::Rejected {
                reason: self.to_string(),
            },
            GatewayError::PersistenceFailure(_) | GatewayError::ProviderUnavailable(_) => {
                AckOutcome::RetryLater {
                    reason: self.to_string(),
                }
            }
            GatewayError::IgnoredEvent(_)
            | GatewayError::AlreadyProcessed
            | GatewayError::LockContention
            | GatewayError::UnknownOrder(_)
            | GatewayError::RejectedEvent(_) => AckOutcome::Accepted,
        }
    }

    /// Whether a later attempt (redelivery or next sweep) may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::PersistenceFailure(_) | GatewayError::ProviderUnavailable(_)
        )
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidSignature(m) => GatewayError::InvalidSignature(m),
            ProviderError::MalformedPayload(m) => GatewayError::MalformedPayload(m),
            ProviderError::IgnoredEvent(m) => GatewayError::IgnoredEvent(m),
            ProviderError::ProviderUnavailable(m) => GatewayError::ProviderUnavailable(m),
            ProviderError::NotFound(m) => GatewayError::UnknownOrder(m),
            ProviderError::UnknownProvider(m) | ProviderError::Configuration(m) => {
                GatewayError::Configuration(m)
            }
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::PersistenceFailure(err.to_string())
    }
}

impl From<TransitionError> for GatewayError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::OrderNotFound(order_ref) => GatewayError::UnknownOrder(order_ref),
            TransitionError::Persistence(e) => GatewayError::PersistenceFailure(e.to_string()),
            other @ (TransitionError::RefundNotFound(_)
            | TransitionError::RefundExceedsSettled { .. }
            | TransitionError::InvalidRefund(_)
            | TransitionError::InvalidEvent(_)) => GatewayError::RejectedEvent(other.to_string()),
        }
    }
}

// ============================================================================
// HTTP-facing errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    Conflict,
    UnknownProvider,
    RefundNotAllowed,
    RefundExceedsSettled,
    PersistenceFailure,
    InternalError,
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: ErrorCode,
    message: String,
    retryable: bool,
}

impl AppError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::ValidationError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, ErrorCode::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError, message)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                retryable: self.retryable,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { key } => AppError::conflict(format!("duplicate reference {}", key)),
            other => {
                tracing::error!(error = %other, "Order store error");
                AppError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorCode::PersistenceFailure,
                    "order store unavailable",
                )
                .retryable()
            }
        }
    }
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::OrderNotFound(order_ref) => {
                AppError::not_found(format!("order {} not found", order_ref))
            }
            TransitionError::RefundNotFound(refund_ref) => {
                AppError::not_found(format!("refund {} not found", refund_ref))
            }
            e @ TransitionError::RefundExceedsSettled { .. } => AppError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorCode::RefundExceedsSettled,
                e.to_string(),
            ),
            e @ (TransitionError::InvalidRefund(_) | TransitionError::InvalidEvent(_)) => {
                AppError::new(StatusCode::CONFLICT, ErrorCode::RefundNotAllowed, e.to_string())
            }
            TransitionError::Persistence(e) => e.into(),
        }
    }
}

impl From<ReconciliationError> for AppError {
    fn from(err: ReconciliationError) -> Self {
        match err {
            e @ ReconciliationError::InvalidWindow(_) => AppError::validation(e.to_string()),
            ReconciliationError::Store(e) => e.into(),
            e @ ReconciliationError::Scheduler(_) => AppError::internal(e.to_string()),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::UnknownProvider(m) => {
                AppError::new(StatusCode::NOT_FOUND, ErrorCode::UnknownProvider, m)
            }
            other => AppError::internal(other.to_string()),
        }
    }
}
