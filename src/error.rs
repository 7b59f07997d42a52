use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use log::error;
use std::fmt::Display;

/// Errors returned by the HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn forbidden(msg: impl Into<String>) -> Self {
        ApiError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }

    pub fn bad_request(err: impl Display) -> Self {
        ApiError::BadRequest(err.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(e) => {
                // Keep the cause chain in the log, not in the response
                error!("[HTTP] Internal error: {:?}", e);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::forbidden("no").status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("gone").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::bad_request("bad").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::from(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_error_is_not_leaked() {
        let response = ApiError::from(anyhow::anyhow!("database password is hunter2")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
