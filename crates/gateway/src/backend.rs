use axum::http::StatusCode;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::ProxyError;

pub(crate) const REQUEST_ID_HEADER: &str = "x-request-id";

pub(crate) const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const UPLOAD_TIMEOUT: Duration = Duration::from_secs(90);
pub(crate) const ANALYZE_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const RESULTS_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const EXPORT_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP access to the analysis backend. Cheap to clone.
#[derive(Clone)]
pub(crate) struct BackendClient {
    http: Client,
    base_url: String,
}

impl BackendClient {
    pub(crate) fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    pub(crate) fn ws_url(&self, job_id: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/ws/jobs/{job_id}")
    }

    pub(crate) fn get(&self, path: &str, request_id: &str, timeout: Duration) -> RequestBuilder {
        self.http
            .get(self.url(path))
            .header(REQUEST_ID_HEADER, request_id)
            .timeout(timeout)
    }

    pub(crate) fn post(&self, path: &str, request_id: &str, timeout: Duration) -> RequestBuilder {
        self.http
            .post(self.url(path))
            .header(REQUEST_ID_HEADER, request_id)
            .timeout(timeout)
    }

    /// Sends the request and turns non-success statuses into
    /// `ProxyError::Backend` carrying the backend's own body.
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Response, ProxyError> {
        let response = request
            .send()
            .await
            .map_err(|err| ProxyError::from_transport(&err))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let body = read_error_body(response).await;
        Err(ProxyError::Backend { status, body })
    }

    pub(crate) async fn send_json(&self, request: RequestBuilder) -> Result<Value, ProxyError> {
        let response = self.send(request).await?;
        response
            .json::<Value>()
            .await
            .map_err(|err| ProxyError::NoResponse(format!("unreadable backend body: {err}")))
    }
}

async fn read_error_body(response: Response) -> Value {
    let reason = response
        .status()
        .canonical_reason()
        .unwrap_or("Backend error")
        .to_string();
    match response.text().await {
        Ok(text) if text.trim().is_empty() => json!({ "error": reason }),
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|_| json!({ "error": text })),
        Err(err) => json!({ "error": format!("{reason}: {err}") }),
    }
}
