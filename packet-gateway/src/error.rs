//! HTTP error mapping

use crate::api::{ErrorBody, ErrorResponse};
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use packet_core::ErrorCategory;
use tracing::{error, warn};

/// Handler error
#[derive(Debug)]
pub enum ApiError {
    /// Engine error, mapped by category
    Engine(packet_core::Error),
    /// Request could not be decoded
    BadRequest(String),
}

impl From<packet_core::Error> for ApiError {
    fn from(err: packet_core::Error) -> Self {
        ApiError::Engine(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// HTTP status for an error class
pub fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::Validation => StatusCode::BAD_REQUEST,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::Conflict => StatusCode::CONFLICT,
        ErrorCategory::Anomaly => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCategory::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn category_name(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Validation => "validation",
        ErrorCategory::NotFound => "not_found",
        ErrorCategory::Conflict => "conflict",
        ErrorCategory::Anomaly => "anomaly",
        ErrorCategory::Transient => "transient",
        ErrorCategory::Internal => "internal",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Engine(err) => {
                let category = err.category();
                let status = status_for(category);
                match category {
                    ErrorCategory::Internal => error!(error = %err, "Request failed"),
                    ErrorCategory::Transient | ErrorCategory::Anomaly => {
                        warn!(code = err.code(), error = %err, "Request rejected")
                    }
                    _ => {}
                }
                // Internal details stay in the log
                let message = match category {
                    ErrorCategory::Internal => "internal error".to_string(),
                    _ => err.to_string(),
                };
                (
                    status,
                    ErrorBody {
                        code: err.code().to_string(),
                        message,
                        category: category_name(category).to_string(),
                    },
                )
            }
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: "BAD_REQUEST".to_string(),
                    message,
                    category: category_name(ErrorCategory::Validation).to_string(),
                },
            ),
        };

        (status, Json(ErrorResponse { error: body })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_core::{Error, PacketId};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::PacketNotFound(PacketId::new()), StatusCode::NOT_FOUND),
            (Error::NoSharesRemaining(PacketId::new()), StatusCode::CONFLICT),
            (
                Error::ServiceUnavailable("busy".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::InvariantViolation("bad".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }

    #[test]
    fn test_bad_request() {
        let response = ApiError::BadRequest("nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
