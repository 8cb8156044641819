// Ingress error responses
//
// Error kinds map one-to-one onto status codes; the response body is
// always `{"error": "<code>", "detail": "<text>"}`. Unavailable carries
// Retry-After so well-behaved SDKs back off instead of hammering.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    /// Missing, malformed or unknown API key.
    #[error("{0}")]
    Auth(String),
    /// Body exceeded the configured ceiling (measured after decompression).
    #[error("payload too large (max {0} bytes)")]
    PayloadTooLarge(usize),
    /// Body failed to decode or contained no recognizable span objects.
    #[error("{0}")]
    BadRequest(String),
    /// A downstream dependency cannot be reached.
    #[error("{0}")]
    Unavailable(String),
}

/// Wire shape of every error response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub detail: String,
}

impl IngressError {
    fn status(&self) -> StatusCode {
        match self {
            IngressError::Auth(_) => StatusCode::UNAUTHORIZED,
            IngressError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            IngressError::BadRequest(_) => StatusCode::BAD_REQUEST,
            IngressError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            IngressError::Auth(_) => "unauthorized",
            IngressError::PayloadTooLarge(_) => "payload_too_large",
            IngressError::BadRequest(_) => "bad_request",
            IngressError::Unavailable(_) => "unavailable",
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.code().to_string(),
            detail: self.to_string(),
        });
        if status == StatusCode::SERVICE_UNAVAILABLE {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            IngressError::Auth("bad key".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            IngressError::PayloadTooLarge(5).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            IngressError::BadRequest("nope".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            IngressError::Unavailable("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
