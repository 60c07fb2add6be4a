use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// Failure taxonomy for proxied routes. Each variant maps to exactly one
/// response shape; callers never build error responses by hand.
#[derive(Debug)]
pub(crate) enum ProxyError {
    BadRequest(String),
    PayloadTooLarge(String),
    /// Backend answered with a non-success status; forwarded unchanged.
    Backend { status: StatusCode, body: Value },
    /// Request was sent but nothing usable came back (refused, reset, timeout).
    NoResponse(String),
    /// Request could not even be built or dispatched.
    RequestSetup(String),
    /// Local failure; details stay in the log.
    Internal(String),
}

impl ProxyError {
    pub(crate) fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_builder() {
            ProxyError::RequestSetup(err.to_string())
        } else {
            ProxyError::NoResponse(err.to_string())
        }
    }

    pub(crate) fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Backend { status, .. } => *status,
            ProxyError::NoResponse(_) | ProxyError::RequestSetup(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The upload route reports backend failures as `{error: detail}`.
    pub(crate) fn into_upload_error(self) -> Self {
        match self {
            ProxyError::Backend { status, body } => {
                let detail = body.get("detail").filter(|value| !value.is_null()).cloned();
                let body = match detail {
                    Some(detail) => json!({ "error": detail }),
                    None if body.get("error").is_some() => body,
                    None => json!({ "error": body }),
                };
                ProxyError::Backend { status, body }
            }
            other => other,
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::BadRequest(message) | ProxyError::PayloadTooLarge(message) => {
                f.write_str(message)
            }
            ProxyError::Backend { status, .. } => write!(f, "backend returned {status}"),
            ProxyError::NoResponse(message) => {
                write!(f, "Backend unavailable: no response ({message})")
            }
            ProxyError::RequestSetup(message) => {
                write!(f, "Backend request could not be sent: {message}")
            }
            ProxyError::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ProxyError::Backend { body, .. } => body,
            ProxyError::Internal(message) => {
                tracing::error!(error = %message, "internal server error");
                json!({ "error": "Internal server error" })
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
