use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid query: {0}")]
    QuerySyntax(String),

    #[error("Unsupported query: {0}")]
    QuerySemantic(String),

    #[error("Invalid dataset: {0}")]
    SchemaValidation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Service busy: {0}")]
    Busy(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The realm used in `WWW-Authenticate` for a protected dataset.
    pub fn auth_realm(dataset: &str) -> String {
        format!("Basic realm=\"Access to {dataset} data\", charset=\"UTF-8\"")
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::QuerySyntax(_) | AppError::QuerySemantic(_) => StatusCode::BAD_REQUEST,
            AppError::SchemaValidation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal details stay in the log; the client gets a generic sentence
        let body = match &self {
            AppError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                "An internal error occurred.".to_string()
            }
            other => other.to_string(),
        };

        match self {
            AppError::Unauthorized(dataset) => (
                status,
                [
                    (header::WWW_AUTHENTICATE, AppError::auth_realm(&dataset)),
                    (header::CONTENT_TYPE, "text/plain".to_string()),
                ],
                format!("Unauthorized access to {dataset}."),
            )
                .into_response(),
            _ => (
                status,
                [(header::CONTENT_TYPE, "text/plain".to_string())],
                body,
            )
                .into_response(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<mysql_async::Error> for AppError {
    fn from(err: mysql_async::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
