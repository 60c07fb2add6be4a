use serde_json::Value;
use std::fmt;

/// Failure of one gateway call, carrying the message shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Rejected locally before any request was sent.
    InvalidInput(String),
    /// The gateway answered with a non-2xx status.
    Http {
        status: u16,
        message: String,
        body: Option<Value>,
    },
    /// The request was sent but nothing came back.
    NoResponse(String),
    /// The request could not be built or sent.
    Request(String),
    /// A 2xx body did not match the expected shape.
    Decode(String),
    Io(String),
}

impl ClientError {
    /// Message priority: payload `error`, then `detail`, then the status text.
    pub fn from_status(status: u16, status_text: Option<&str>, body: Option<Value>) -> Self {
        let message = body
            .as_ref()
            .and_then(payload_message)
            .or_else(|| status_text.map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {status}"));
        ClientError::Http {
            status,
            message,
            body,
        }
    }

    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_builder() {
            return ClientError::Request(err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return ClientError::NoResponse(format!("No response from server ({err})"));
        }
        ClientError::Request(err.to_string())
    }

    pub fn message(&self) -> &str {
        match self {
            ClientError::InvalidInput(message)
            | ClientError::Http { message, .. }
            | ClientError::NoResponse(message)
            | ClientError::Request(message)
            | ClientError::Decode(message)
            | ClientError::Io(message) => message,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn payload_message(body: &Value) -> Option<String> {
    ["error", "detail"].iter().find_map(|key| match body.get(key) {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.clone()),
        Some(Value::Null) | None => None,
        Some(Value::String(_)) => None,
        Some(other) => Some(other.to_string()),
    })
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Http {
                status, message, ..
            } if *message != format!("HTTP {status}") => write!(f, "{message} (HTTP {status})"),
            other => f.write_str(other.message()),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}
