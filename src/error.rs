use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::db::RepositoryError;

/// Failures of the monitoring endpoints. Details go to the log only.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Unavailable(msg) => {
                tracing::warn!(reason = %msg, "Status unavailable");
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Repository(e) => {
                tracing::error!(error = %e, "Status query failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = status.canonical_reason().unwrap_or("Error");
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn respond(err: AppError) -> (StatusCode, String) {
        let response = err.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn unavailable_returns_503() {
        let (status, body) = respond(AppError::Unavailable("health check pending".into())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "Service Unavailable");
    }

    #[tokio::test]
    async fn repository_errors_do_not_leak_details() {
        let (status, body) = respond(AppError::Repository(RepositoryError::NotFound(
            "ticket 7".into(),
        )))
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.contains("ticket 7"));
    }
}
