use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Bad input shape or content.  Carries field-level messages for the caller.
    #[error("validation failed")]
    Validation(Vec<String>),
    /// Signature or account mismatch.  Surfaced generically; no detail about
    /// which check failed leaks to the caller.
    #[error("authorization failed")]
    Authorization,
    /// A state-machine transition or destroy was not permitted.
    #[error("{0}")]
    Conflict(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("call flow logic `{0}` is not registered")]
    UnknownCallFlowLogic(String),
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("provider request failed")]
    Provider(#[from] reqwest::Error),
}

impl AppError {
    pub fn invalid(message: impl Into<String>) -> Self {
        AppError::Validation(vec![message.into()])
    }

    /// Translate a unique-constraint violation into a conflict; any other
    /// database error passes through unchanged.
    pub fn on_unique_violation(e: sqlx::Error, message: &'static str) -> Self {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.code().as_deref() == Some("23505") {
                return AppError::Conflict(message);
            }
        }
        AppError::Database(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Validation(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                axum::Json(json!({ "errors": errors })),
            )
                .into_response(),
            AppError::Authorization => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
            AppError::Conflict(message) => (
                StatusCode::CONFLICT,
                axum::Json(json!({ "errors": [message] })),
            )
                .into_response(),
            AppError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                axum::Json(json!({ "errors": [format!("{resource} not found")] })),
            )
                .into_response(),
            AppError::UnknownCallFlowLogic(key) => {
                error!(call_flow_logic = %key, "call flow logic is not registered");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            AppError::Database(e) => {
                error!(error = %e, "database error");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            AppError::Provider(e) => {
                error!(error = %e, "provider request failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
