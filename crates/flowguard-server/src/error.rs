use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flowguard_core::FlowguardError;

// ---------------------------------------------------------------------------
// AppError — unified error type for HTTP responses
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if let Some(e) = self.0.downcast_ref::<FlowguardError>() {
            match e {
                FlowguardError::InvalidPolicyKey(_) | FlowguardError::InvalidPolicyValue { .. } => {
                    StatusCode::BAD_REQUEST
                }
                FlowguardError::ActionNotFound(_) | FlowguardError::DeviceNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                FlowguardError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                FlowguardError::InvariantViolation(_)
                | FlowguardError::QueueDb(_)
                | FlowguardError::Io(_)
                | FlowguardError::Yaml(_)
                | FlowguardError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
