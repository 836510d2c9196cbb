use axum::{
    extract::multipart::{MultipartError, MultipartRejection},
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::response::ApiResponse;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("Invalid or expired token")]
    TokenInvalid,

    #[error("Refresh token is expired or used")]
    SessionMismatch,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) | AppError::TokenInvalid | AppError::SessionMismatch => {
                StatusCode::UNAUTHORIZED
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wraps a store error, turning unique-key violations into `Conflict`.
    pub fn from_store(err: anyhow::Error, conflict_message: &str) -> Self {
        let unique_violation = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<sqlx::Error>())
            .any(|e| match e {
                sqlx::Error::Database(db) => db.is_unique_violation(),
                _ => false,
            });
        if unique_violation {
            AppError::Conflict(conflict_message.to_string())
        } else {
            AppError::Internal(err)
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Internal(e) => {
                error!(error = ?e, "internal error");
                "Something went wrong".to_string()
            }
            other => other.to_string(),
        };
        ApiResponse::<()>::failure(status, message).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<MultipartRejection> for AppError {
    fn from(rejection: MultipartRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::BadRequest(format!("Invalid multipart body: {}", err.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_status(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn token_errors_are_unauthorized() {
        assert_eq!(response_status(AppError::TokenInvalid), StatusCode::UNAUTHORIZED);
        assert_eq!(response_status(AppError::SessionMismatch), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response_status(AppError::Unauthorized("nope".into())),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn client_errors_keep_their_status() {
        assert_eq!(
            response_status(AppError::BadRequest("oops".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            response_status(AppError::NotFound("gone".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            response_status(AppError::Conflict("taken".into())),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn internal_hides_details() {
        let err = AppError::Internal(anyhow::anyhow!("connection refused to 10.0.0.3"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn plain_anyhow_is_not_a_conflict() {
        let err = AppError::from_store(anyhow::anyhow!("boom"), "taken");
        assert!(matches!(err, AppError::Internal(_)));
    }
}
