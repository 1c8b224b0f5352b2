use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::error::BluetoothError;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or out-of-range request body.
    #[error("{0}")]
    BadRequest(String),

    #[error("adapter unavailable")]
    AdapterUnavailable,

    /// Device-level failure: unknown device, rejected command, no adapter for removal.
    #[error("{0}")]
    DeviceCommand(String),

    #[error("{0}")]
    ScanFailed(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::DeviceCommand(_) => StatusCode::BAD_REQUEST,
            ApiError::AdapterUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ScanFailed(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn device(err: BluetoothError) -> Self {
        ApiError::DeviceCommand(err.to_string())
    }

    pub fn scan(err: BluetoothError) -> Self {
        ApiError::ScanFailed(format!("scan failed: {}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
