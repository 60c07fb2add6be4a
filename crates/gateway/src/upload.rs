use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::backend::{ANALYZE_TIMEOUT, HEALTH_TIMEOUT, UPLOAD_TIMEOUT};
use crate::config::GatewayConfig;
use crate::error::ProxyError;
use crate::{AppState, RequestId};

const PDF_MIME: &str = "application/pdf";
const FILE_FIELD: &str = "file";
const ANALYZE_FIELDS: [&str; 5] = [
    "file_path",
    "analysis_method",
    "llm_provider",
    "model",
    "fund_id",
];

/// A PDF buffered on local disk while it is forwarded. The file is removed
/// when the value is dropped, whichever way the request ends.
pub(crate) struct StagedUpload {
    path: PathBuf,
    file_name: String,
    size: u64,
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "staged upload removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.path.display(),
                error = %err,
                "failed to remove staged upload"
            ),
        }
    }
}

pub(crate) async fn upload(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ProxyError> {
    let staged = stage_upload(&state.config, &mut multipart).await.map_err(|err| {
        warn!(request_id = %request_id, error = %err, "upload rejected");
        err
    })?;
    info!(
        request_id = %request_id,
        file_name = %staged.file_name,
        size = staged.size,
        "upload received, forwarding to backend"
    );

    let result = forward_upload(&state, &staged, &request_id).await;
    drop(staged);

    match result {
        Ok(body) => {
            info!(
                request_id = %request_id,
                file_path = ?body.get("file_path"),
                "upload forwarded"
            );
            Ok(Json(body))
        }
        Err(err) => {
            warn!(request_id = %request_id, error = %err, "upload proxy error");
            Err(err.into_upload_error())
        }
    }
}

async fn stage_upload(
    config: &GatewayConfig,
    multipart: &mut Multipart,
) -> Result<StagedUpload, ProxyError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let content_type = field.content_type().unwrap_or_default();
        if !is_pdf_mime(content_type) {
            return Err(ProxyError::BadRequest(
                "Only PDF files are allowed".to_string(),
            ));
        }
        return write_field(config, field).await;
    }
    Err(ProxyError::BadRequest("No file uploaded".to_string()))
}

async fn write_field(
    config: &GatewayConfig,
    mut field: Field<'_>,
) -> Result<StagedUpload, ProxyError> {
    let file_name = sanitize_file_name(field.file_name().unwrap_or_default());
    let mut staged = StagedUpload {
        path: config.upload_dir.join(staged_file_name(&file_name)),
        file_name,
        size: 0,
    };
    let mut file = tokio::fs::File::create(&staged.path)
        .await
        .map_err(|err| ProxyError::Internal(format!("failed to stage upload: {err}")))?;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        staged.size = staged.size.saturating_add(chunk.len() as u64);
        if staged.size > config.max_upload_bytes {
            return Err(ProxyError::PayloadTooLarge(format!(
                "File exceeds the {} byte upload limit",
                config.max_upload_bytes
            )));
        }
        file.write_all(&chunk)
            .await
            .map_err(|err| ProxyError::Internal(format!("failed to stage upload: {err}")))?;
    }
    file.flush()
        .await
        .map_err(|err| ProxyError::Internal(format!("failed to stage upload: {err}")))?;
    Ok(staged)
}

async fn forward_upload(
    state: &AppState,
    staged: &StagedUpload,
    request_id: &str,
) -> Result<Value, ProxyError> {
    wake_backend(state, request_id).await;

    let bytes = Bytes::from(
        tokio::fs::read(&staged.path)
            .await
            .map_err(|err| ProxyError::Internal(format!("failed to read staged upload: {err}")))?,
    );
    let mut retried = false;
    loop {
        let part = Part::stream_with_length(bytes.clone(), bytes.len() as u64)
            .file_name(staged.file_name.clone())
            .mime_str(PDF_MIME)
            .map_err(|err| ProxyError::RequestSetup(err.to_string()))?;
        let request = state
            .backend
            .post("/api/upload", request_id, UPLOAD_TIMEOUT)
            .multipart(Form::new().part(FILE_FIELD, part));
        match state.backend.send_json(request).await {
            Err(ProxyError::Backend { status, .. }) if !retried && is_cold_start(status) => {
                warn!(
                    request_id = %request_id,
                    status = status.as_u16(),
                    delay_ms = state.config.upload_retry_delay.as_millis() as u64,
                    "backend not ready, retrying upload once"
                );
                retried = true;
                tokio::time::sleep(state.config.upload_retry_delay).await;
            }
            other => return other,
        }
    }
}

/// Hosted backends sleep when idle; a ping gives them a head start. Failure
/// is logged and ignored because the upload itself will wake them.
async fn wake_backend(state: &AppState, request_id: &str) {
    let request = state.backend.get("/api/health", request_id, HEALTH_TIMEOUT);
    match state.backend.send(request).await {
        Ok(_) => debug!(request_id = %request_id, "backend is awake"),
        Err(err) => warn!(
            request_id = %request_id,
            error = %err,
            "backend unreachable before upload, continuing anyway"
        ),
    }
}

pub(crate) async fn analyze(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ProxyError> {
    if let Some(field) = missing_analyze_field(&body) {
        return Err(ProxyError::BadRequest(format!(
            "invalid analyze request: missing field `{field}`"
        )));
    }
    info!(
        request_id = %request_id,
        file_path = %body["file_path"],
        analysis_method = %body["analysis_method"],
        llm_provider = %body["llm_provider"],
        model = %body["model"],
        fund_id = %body["fund_id"],
        "starting analysis"
    );
    let upstream = state
        .backend
        .post("/api/analyze", &request_id, ANALYZE_TIMEOUT)
        .json(&body);
    match state.backend.send_json(upstream).await {
        Ok(body) => {
            info!(request_id = %request_id, job_id = ?body.get("job_id"), "analysis started");
            Ok(Json(body))
        }
        Err(err) => {
            warn!(request_id = %request_id, error = %err, "analysis request failed");
            Err(err)
        }
    }
}

/// Values are the backend's business; only presence is checked here.
fn missing_analyze_field(body: &Value) -> Option<&'static str> {
    ANALYZE_FIELDS
        .into_iter()
        .find(|field| body.get(field).map_or(true, Value::is_null))
}

fn multipart_error(err: MultipartError) -> ProxyError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ProxyError::PayloadTooLarge(err.body_text())
    } else {
        ProxyError::BadRequest(format!("invalid upload: {}", err.body_text()))
    }
}

fn is_cold_start(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_pdf_mime(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|mime| mime.eq_ignore_ascii_case(PDF_MIME))
}

fn sanitize_file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.pdf".to_string()
    } else {
        cleaned.to_string()
    }
}

fn staged_file_name(file_name: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis}-{}-{file_name}", &nonce[..8])
}
