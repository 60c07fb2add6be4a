use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::DEFAULT_TIMEOUT;
use crate::error::ProxyError;
use crate::jobs::path_segment;
use crate::{AppState, RequestId};

pub(crate) async fn list_traces(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Result<Json<Value>, ProxyError> {
    let request = state.backend.get("/api/traces", &request_id, DEFAULT_TIMEOUT);
    state.backend.send_json(request).await.map(Json).map_err(|err| {
        warn!(request_id = %request_id, error = %err, "failed to list traces");
        err
    })
}

pub(crate) async fn get_trace(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Result<Json<Value>, ProxyError> {
    path_segment("trace id", &trace_id)?;
    let request = state.backend.get(
        &format!("/api/traces/{trace_id}"),
        &request_id,
        DEFAULT_TIMEOUT,
    );
    state.backend.send_json(request).await.map(Json).map_err(|err| {
        warn!(request_id = %request_id, trace_id = %trace_id, error = %err, "failed to fetch trace");
        err
    })
}

/// Trace artifacts are streamed through with the backend's content type.
pub(crate) async fn get_trace_file(
    State(state): State<AppState>,
    Path((trace_id, filename)): Path<(String, String)>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Result<Response, ProxyError> {
    path_segment("trace id", &trace_id)?;
    path_segment("file name", &filename)?;
    let request = state.backend.get(
        &format!("/api/traces/{trace_id}/files/{filename}"),
        &request_id,
        DEFAULT_TIMEOUT,
    );
    let upstream = state.backend.send(request).await.map_err(|err| {
        warn!(
            request_id = %request_id,
            trace_id = %trace_id,
            filename = %filename,
            error = %err,
            "failed to fetch trace file"
        );
        err
    })?;
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| HeaderValue::from_str(value).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    debug!(
        request_id = %request_id,
        trace_id = %trace_id,
        filename = %filename,
        content_length = ?upstream.content_length(),
        "streaming trace file"
    );
    let body = Body::from_stream(upstream.bytes_stream());
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}
