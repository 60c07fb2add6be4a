use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use humantime::format_rfc3339_millis;

use crate::error::ClientError;

pub const DEFAULT_CAPACITY: usize = 1000;
pub const MASK: &str = "***MASKED***";

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "api_key",
    "token",
    "authorization",
    "secret",
    "access_token",
];
const SENSITIVE_HEADERS: &[&str] = &["authorization", "x-api-key", "cookie"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Client-side log of gateway traffic.
///
/// Entries below the threshold are discarded. Kept entries go to a bounded
/// ring buffer, to the `tracing` subscriber and, when configured, to a
/// JSON-lines file.
pub struct ClientLogger {
    min_level: LogLevel,
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
    sink: Option<PathBuf>,
}

impl ClientLogger {
    pub fn new(min_level: LogLevel) -> Self {
        Self {
            min_level,
            capacity: DEFAULT_CAPACITY,
            entries: Mutex::new(VecDeque::new()),
            sink: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.sink = Some(path.into());
        self
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    pub fn log(
        &self,
        level: LogLevel,
        message: &str,
        context: Option<Value>,
        request_id: Option<&str>,
    ) {
        if level < self.min_level {
            return;
        }
        let entry = LogEntry {
            timestamp: format_rfc3339_millis(SystemTime::now()).to_string(),
            level,
            message: message.to_string(),
            context,
            request_id: request_id.map(str::to_string),
        };
        emit_tracing(&entry);
        if let Some(path) = self.sink.as_deref() {
            if let Err(err) = append_entry(path, &entry) {
                tracing::warn!(path = %path.display(), error = %err, "failed to persist client log entry");
            }
        }
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn debug(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Debug, message, context, None);
    }

    pub fn info(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Info, message, context, None);
    }

    pub fn warn(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Warn, message, context, None);
    }

    pub fn error(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Error, message, context, None);
    }

    pub fn log_request(
        &self,
        request_id: &str,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<&Value>,
    ) {
        let mut context = Map::new();
        context.insert("method".into(), Value::from(method));
        context.insert("url".into(), Value::from(url));
        context.insert("headers".into(), headers_to_value(&sanitize_headers(headers)));
        if let Some(body) = body {
            context.insert("body".into(), sanitize_value(body));
        }
        self.log(
            LogLevel::Info,
            &format!("API request: {method} {url}"),
            Some(Value::Object(context)),
            Some(request_id),
        );
    }

    pub fn log_response(
        &self,
        request_id: &str,
        method: &str,
        url: &str,
        status: u16,
        body: Option<&Value>,
        duration: Duration,
    ) {
        let mut context = Map::new();
        context.insert("method".into(), Value::from(method));
        context.insert("url".into(), Value::from(url));
        context.insert("status".into(), Value::from(status));
        context.insert("duration_ms".into(), Value::from(duration.as_millis() as u64));
        if let Some(body) = body {
            context.insert("body".into(), sanitize_value(body));
        }
        self.log(
            LogLevel::Info,
            &format!("API response: {method} {url} {status}"),
            Some(Value::Object(context)),
            Some(request_id),
        );
    }

    pub fn log_error(
        &self,
        request_id: &str,
        method: &str,
        url: &str,
        error: &ClientError,
        duration: Duration,
    ) {
        let mut context = Map::new();
        context.insert("method".into(), Value::from(method));
        context.insert("url".into(), Value::from(url));
        context.insert("error".into(), Value::from(error.message()));
        if let Some(status) = error.status() {
            context.insert("status".into(), Value::from(status));
        }
        if let ClientError::Http {
            body: Some(body), ..
        } = error
        {
            context.insert("body".into(), sanitize_value(body));
        }
        context.insert("duration_ms".into(), Value::from(duration.as_millis() as u64));
        self.log(
            LogLevel::Error,
            &format!("API error: {method} {url}"),
            Some(Value::Object(context)),
            Some(request_id),
        );
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Writes the buffered entries as JSON lines, replacing `path`.
    pub fn export(&self, path: &Path) -> std::io::Result<()> {
        let mut out = String::new();
        for entry in self.entries() {
            let line = serde_json::to_string(&entry).map_err(std::io::Error::other)?;
            out.push_str(&line);
            out.push('\n');
        }
        std::fs::write(path, out)
    }
}

fn emit_tracing(entry: &LogEntry) {
    let request_id = entry.request_id.as_deref().unwrap_or("-");
    let context = entry
        .context
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_default();
    match entry.level {
        LogLevel::Debug => tracing::debug!(request_id, context = %context, "{}", entry.message),
        LogLevel::Info => tracing::info!(request_id, context = %context, "{}", entry.message),
        LogLevel::Warn => tracing::warn!(request_id, context = %context, "{}", entry.message),
        LogLevel::Error => tracing::error!(request_id, context = %context, "{}", entry.message),
    }
}

fn append_entry(path: &Path, entry: &LogEntry) -> std::io::Result<()> {
    let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

fn headers_to_value(headers: &[(String, String)]) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(name, value)| (name.clone(), Value::from(value.as_str())))
            .collect(),
    )
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|needle| key.contains(needle))
}

/// Masks credential-like keys at any depth.
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let masked = if is_sensitive_key(key) {
                        Value::from(MASK)
                    } else {
                        sanitize_value(inner)
                    };
                    (key.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        other => other.clone(),
    }
}

pub fn sanitize_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            if SENSITIVE_HEADERS.iter().any(|needle| lower.contains(needle)) {
                (name.clone(), MASK.to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}
