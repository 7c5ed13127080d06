//! Error types shared by the registry, supervisor, router and API layers

use axum::{
    Json,
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Result alias used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Model '{name}' is already registered")]
    DuplicateModel { name: String },

    #[error("Model '{name}' not found")]
    NotFound { name: String },

    #[error("Model '{name}' is overloaded: {reason}")]
    Overloaded { name: String, reason: String },

    #[error("Request {request_id} to model '{name}' timed out after {elapsed_ms}ms")]
    Timeout {
        name: String,
        request_id: u64,
        elapsed_ms: u64,
    },

    #[error("Worker '{instance}' crashed: {reason}")]
    BackendCrashed { instance: String, reason: String },

    #[error("Backend returned status {status}")]
    BackendError { status: u16, body: Bytes },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Short machine-readable kind, used in response bodies and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::DuplicateModel { .. } => "DuplicateModel",
            GatewayError::NotFound { .. } => "NotFound",
            GatewayError::Overloaded { .. } => "Overloaded",
            GatewayError::Timeout { .. } => "Timeout",
            GatewayError::BackendCrashed { .. } => "BackendCrashed",
            GatewayError::BackendError { .. } => "BackendError",
            GatewayError::Validation { .. } => "Validation",
            GatewayError::Internal { .. } => "Internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::DuplicateModel { .. } => StatusCode::CONFLICT,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Overloaded { .. } | GatewayError::BackendCrashed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BackendError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal {
            message: format!("{:#}", err),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Backend replies are relayed as-is
        if let GatewayError::BackendError { body, .. } = self {
            return (status, body).into_response();
        }

        let message = match &self {
            GatewayError::Internal { message } => {
                tracing::error!(error = %message, "Internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            kind: self.kind(),
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}
