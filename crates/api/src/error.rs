//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use paygate_billing::BillingError;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    /// Whether redelivering the same request later could succeed
    pub retryable: bool,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingHeader(_) => StatusCode::BAD_REQUEST,
            ApiError::Billing(e) => billing_status(e),
        }
    }
}

fn billing_status(error: &BillingError) -> StatusCode {
    match error {
        BillingError::WebhookSignatureFormat(_)
        | BillingError::WebhookTimestampExpired { .. }
        | BillingError::WebhookPayloadParse(_) => StatusCode::BAD_REQUEST,
        BillingError::WebhookSignatureInvalid => StatusCode::UNAUTHORIZED,
        BillingError::NotFound(_) | BillingError::UnknownGateway(_) => StatusCode::NOT_FOUND,
        BillingError::DuplicateEvent { .. } => StatusCode::CONFLICT,
        BillingError::HandlerFailed {
            retryable: false, ..
        } => StatusCode::UNPROCESSABLE_ENTITY,
        BillingError::HandlerFailed {
            retryable: true, ..
        }
        | BillingError::AllGatewaysUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::GatewayOperationFailed { .. } => StatusCode::BAD_GATEWAY,
        BillingError::RetryExhausted { .. } | BillingError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message, retryable) = match &self {
            ApiError::MissingHeader(_) => ("missing_header", self.to_string(), false),
            ApiError::Billing(e) if status.is_server_error() && !e.is_retryable() => {
                tracing::error!(error = %e, code = e.code(), "Billing request failed");
                (e.code(), e.to_string(), false)
            }
            ApiError::Billing(e) => (e.code(), e.to_string(), e.is_retryable()),
        };

        let body = Json(ErrorResponse {
            error: code.to_string(),
            message,
            retryable,
        });

        (status, body).into_response()
    }
}
