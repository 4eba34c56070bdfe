use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use relay_core::RelayError;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::error;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    error: String,
}

/// Error returned by every handler; maps core failures onto HTTP status codes.
#[derive(Debug)]
pub enum ApiError {
    Relay(RelayError),
    Unauthorized,
    Forbidden(&'static str),
    BadRequest(String),
    PayloadTooLarge,
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self::Relay(err)
    }
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}

fn body(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: error.into() })).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => body(StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden(reason) => body(StatusCode::FORBIDDEN, reason),
            ApiError::BadRequest(msg) => body(StatusCode::BAD_REQUEST, msg),
            ApiError::PayloadTooLarge => body(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"),
            ApiError::Relay(err) => match err {
                RelayError::NotFound(_) => body(StatusCode::NOT_FOUND, err.to_string()),
                RelayError::Expired => body(StatusCode::GONE, err.to_string()),
                RelayError::AlreadyPaired | RelayError::Disconnected => {
                    body(StatusCode::CONFLICT, err.to_string())
                }
                RelayError::InvalidInput(_) => body(StatusCode::BAD_REQUEST, err.to_string()),
                RelayError::RateLimited { reset_at } => {
                    let wait = reset_at - OffsetDateTime::now_utc();
                    let secs = wait.whole_seconds().max(0) + i64::from(wait.subsec_nanoseconds() > 0);
                    let mut response = body(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
                    if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                        response.headers_mut().insert(RETRY_AFTER, value);
                    }
                    response
                }
                RelayError::Storage(_) => {
                    error!(error = ?err, "request failed on storage");
                    body(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                }
                RelayError::BackendUnavailable(_) => {
                    error!(error = ?err, "request failed on backend");
                    body(StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
                }
            },
        }
    }
}
