use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lumen_engine::{EngineError, ErrorKind};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid user identity")]
    Unauthorized,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Engine(err) => match err.kind() {
                ErrorKind::InputInvalid => StatusCode::BAD_REQUEST,
                ErrorKind::AuthMismatch => StatusCode::FORBIDDEN,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_engine_errors_map_to_status_codes() {
        let cases = [
            (EngineError::InputInvalid("empty".into()), StatusCode::BAD_REQUEST),
            (EngineError::AuthMismatch(Uuid::new_v4()), StatusCode::FORBIDDEN),
            (EngineError::not_found("thread", Uuid::new_v4()), StatusCode::NOT_FOUND),
            (EngineError::DependencyUnavailable("mongo".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (EngineError::Retryable("503".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_bad_request_response() {
        let response = ApiError::BadRequest("Test error".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
