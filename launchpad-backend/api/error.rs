use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::generation::GenerationError;
use crate::manager::ProvisionError;
use crate::sandbox::SandboxError;

/// Error response: `{"error": <message>}` plus an optional `Retry-After`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<ProvisionError> for ApiError {
    fn from(e: ProvisionError) -> Self {
        let status = match &e {
            ProvisionError::EmptyFileSet => StatusCode::BAD_REQUEST,
            ProvisionError::UnknownProject(_) => StatusCode::NOT_FOUND,
            ProvisionError::BackendUnavailable { .. } | ProvisionError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProvisionError::Superseded => StatusCode::CONFLICT,
            ProvisionError::Backend(inner) => match inner {
                SandboxError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                SandboxError::BackendTimeout(_) | SandboxError::ServerStartTimeout { .. } => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                SandboxError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
                SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            },
        };
        if status.is_server_error() {
            tracing::error!(error = %e, status = status.as_u16(), "provisioning request failed");
        }
        Self {
            status,
            message: e.user_message(),
            retry_after: e.retry_after(),
        }
    }
}

impl From<GenerationError> for ApiError {
    fn from(e: GenerationError) -> Self {
        let status = match &e {
            GenerationError::EmptyPrompt => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!(error = %e, "generation request failed");
        }
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(json!({ "error": self.message }))).into_response();
        if let Some(after) = self.retry_after {
            let secs = after.as_secs_f64().ceil().max(1.0) as u64;
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
