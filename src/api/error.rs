use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::tracker::TrackerError;

/// Error body returned by every admin endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Always false on errors
    pub success: bool,
    /// Human-readable error message
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// A tracker error plus the status code it maps to at the HTTP boundary.
#[derive(Debug)]
pub struct ApiError(pub TrackerError);

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        Self(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self(TrackerError::Database(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TrackerError::NotFound(_) => StatusCode::NOT_FOUND,
            TrackerError::InvalidState(_) => StatusCode::BAD_REQUEST,
            TrackerError::Conflict(_) => StatusCode::CONFLICT,
            TrackerError::Database(e) => {
                tracing::error!(error = %e, "database error in request handler");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse::new("Internal server error")),
                )
                    .into_response();
            }
        };
        (status, Json(ErrorResponse::new(self.0.to_string()))).into_response()
    }
}

/// 400 with a caller-facing validation message.
pub fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_error_taxonomy() {
        let cases = [
            (TrackerError::NotFound(1), StatusCode::NOT_FOUND),
            (
                TrackerError::InvalidState("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (TrackerError::Conflict(1), StatusCode::CONFLICT),
            (
                TrackerError::Database(sqlx::Error::PoolClosed),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn database_errors_do_not_leak_details() {
        let body = ErrorResponse::new("Internal server error");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Internal server error");
    }
}
