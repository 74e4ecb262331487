use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::services::JobError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// JSON error response of the panel API.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let (status, code) = match &err {
            JobError::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            JobError::UnknownDataset(_) => (StatusCode::NOT_FOUND, "unknown_dataset"),
            JobError::Platform(_)
            | JobError::RemoteFailure { .. }
            | JobError::Timeout { .. }
            | JobError::MissingOutput { .. }
            | JobError::InvalidArtifact { .. } => (StatusCode::BAD_GATEWAY, "platform"),
            JobError::Markers(_) | JobError::Task(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %err, %status, "request failed");
        }
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
