use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::backend::{
    DEFAULT_TIMEOUT, EXPORT_TIMEOUT, HEALTH_TIMEOUT, RESULTS_TIMEOUT, STATUS_TIMEOUT,
};
use crate::error::ProxyError;
use crate::{AppState, RequestId};

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const XLSX_DISPOSITION: &str = "attachment; filename=ocrd_results.xlsx";

/// Ids are interpolated into backend paths, so only plain tokens pass.
pub(crate) fn path_segment(kind: &str, value: &str) -> Result<(), ProxyError> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ProxyError::BadRequest(format!("invalid {kind}: {value}")))
    }
}

pub(crate) async fn backend_health(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Response {
    info!(request_id = %request_id, backend = %state.backend.base_url(), "checking backend health");
    let request = state.backend.get("/api/health", &request_id, HEALTH_TIMEOUT);
    match state.backend.send_json(request).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => {
            warn!(request_id = %request_id, error = %err, "backend health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Backend health check failed",
                    "backend": state.backend.base_url(),
                    "details": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}

pub(crate) async fn models(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Result<Json<Value>, ProxyError> {
    let request = state.backend.get("/api/models", &request_id, DEFAULT_TIMEOUT);
    state.backend.send_json(request).await.map(Json).map_err(|err| {
        warn!(request_id = %request_id, error = %err, "failed to fetch models");
        err
    })
}

pub(crate) async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Result<Json<Value>, ProxyError> {
    path_segment("job id", &job_id)?;
    let request = state.backend.get(
        &format!("/api/jobs/{job_id}/status"),
        &request_id,
        STATUS_TIMEOUT,
    );
    match state.backend.send_json(request).await {
        Ok(body) => {
            info!(
                request_id = %request_id,
                job_id = %job_id,
                status = ?body.get("status"),
                progress = ?body.get("progress"),
                "job status"
            );
            Ok(Json(body))
        }
        Err(err) => {
            warn!(request_id = %request_id, job_id = %job_id, error = %err, "status error");
            Err(err)
        }
    }
}

pub(crate) async fn results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Result<Json<Value>, ProxyError> {
    path_segment("job id", &job_id)?;
    let request = state.backend.get(
        &format!("/api/jobs/{job_id}/results"),
        &request_id,
        RESULTS_TIMEOUT,
    );
    match state.backend.send_json(request).await {
        Ok(body) => {
            info!(request_id = %request_id, job_id = %job_id, "results retrieved");
            Ok(Json(body))
        }
        Err(err) => {
            warn!(request_id = %request_id, job_id = %job_id, error = %err, "results error");
            Err(err)
        }
    }
}

pub(crate) async fn export_excel(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Result<Response, ProxyError> {
    path_segment("job id", &job_id)?;
    let request = state.backend.get(
        &format!("/api/jobs/{job_id}/export/excel"),
        &request_id,
        EXPORT_TIMEOUT,
    );
    let upstream = state.backend.send(request).await.map_err(|err| {
        warn!(request_id = %request_id, job_id = %job_id, error = %err, "excel export error");
        err
    })?;
    info!(
        request_id = %request_id,
        job_id = %job_id,
        content_length = ?upstream.content_length(),
        "streaming excel export"
    );
    let body = Body::from_stream(upstream.bytes_stream());
    Ok((
        [
            (header::CONTENT_TYPE, XLSX_MIME),
            (header::CONTENT_DISPOSITION, XLSX_DISPOSITION),
        ],
        body,
    )
        .into_response())
}

pub(crate) async fn export_json(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Result<Json<Value>, ProxyError> {
    path_segment("job id", &job_id)?;
    let request = state.backend.get(
        &format!("/api/jobs/{job_id}/export/json"),
        &request_id,
        EXPORT_TIMEOUT,
    );
    state.backend.send_json(request).await.map(Json).map_err(|err| {
        warn!(request_id = %request_id, job_id = %job_id, error = %err, "json export error");
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve, spawn_gateway, temp_dir, test_config};
    use axum::routing::get;
    use axum::Router;

    fn jobs_backend() -> Router {
        Router::new()
            .route(
                "/api/health",
                get(|| async { Json(json!({"status": "healthy", "service": "ocrd"})) }),
            )
            .route(
                "/api/jobs/:job_id/status",
                get(|Path(job_id): Path<String>| async move {
                    if job_id == "missing" {
                        return (
                            StatusCode::NOT_FOUND,
                            Json(json!({"detail": "Job not found"})),
                        );
                    }
                    (
                        StatusCode::OK,
                        Json(json!({
                            "job_id": job_id,
                            "status": "processing",
                            "progress": 40,
                            "message": "Classifying instruments"
                        })),
                    )
                }),
            )
            .route(
                "/api/jobs/:job_id/export/excel",
                get(|| async { (StatusCode::OK, vec![0x50u8, 0x4b, 0x03, 0x04, 0x14]) }),
            )
            .route(
                "/api/jobs/:job_id/export/json",
                get(|| async {
                    Json(json!({
                        "sections": {"future": {"equity_future": {
                            "allowed": null, "note": "", "evidence": {"text": ""}
                        }}},
                        "total_instruments": 1
                    }))
                }),
            )
    }

    #[test]
    fn path_segments_reject_traversal() {
        assert!(path_segment("job id", "abc123").is_ok());
        assert!(path_segment("file", "prompt_01.json").is_ok());
        assert!(path_segment("job id", "..").is_err());
        assert!(path_segment("job id", "a/b").is_err());
        assert!(path_segment("job id", "").is_err());
    }

    #[tokio::test]
    async fn status_is_passed_through() {
        let backend = serve(jobs_backend()).await;
        let dir = temp_dir("jobs-status");
        let (gateway, _) = spawn_gateway(test_config(&backend, &dir)).await;

        let body: Value = reqwest::get(format!("{gateway}/api/jobs/abc123/status"))
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        assert_eq!(body["job_id"], "abc123");
        assert_eq!(body["progress"], 40);
    }

    #[tokio::test]
    async fn backend_404_keeps_status_and_body() {
        let backend = serve(jobs_backend()).await;
        let dir = temp_dir("jobs-404");
        let (gateway, _) = spawn_gateway(test_config(&backend, &dir)).await;

        let response = reqwest::get(format!("{gateway}/api/jobs/missing/status"))
            .await
            .expect("request");
        assert_eq!(response.status().as_u16(), 404);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body, json!({"detail": "Job not found"}));
    }

    #[tokio::test]
    async fn excel_export_sets_attachment_headers() {
        let backend = serve(jobs_backend()).await;
        let dir = temp_dir("jobs-excel");
        let (gateway, _) = spawn_gateway(test_config(&backend, &dir)).await;

        let response = reqwest::get(format!("{gateway}/api/jobs/abc123/export/excel"))
            .await
            .expect("request");
        assert!(response.status().is_success());
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok()),
            Some(XLSX_MIME)
        );
        assert_eq!(
            response
                .headers()
                .get("content-disposition")
                .and_then(|value| value.to_str().ok()),
            Some(XLSX_DISPOSITION)
        );
        let bytes = response.bytes().await.expect("bytes");
        assert_eq!(&bytes[..], &[0x50, 0x4b, 0x03, 0x04, 0x14]);
    }

    #[tokio::test]
    async fn json_export_is_unchanged() {
        let backend = serve(jobs_backend()).await;
        let dir = temp_dir("jobs-json");
        let (gateway, _) = spawn_gateway(test_config(&backend, &dir)).await;

        let body: Value = reqwest::get(format!("{gateway}/api/jobs/abc123/export/json"))
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        assert_eq!(
            body["sections"]["future"]["equity_future"]["allowed"],
            Value::Null
        );
        assert_eq!(body["total_instruments"], 1);
    }

    #[tokio::test]
    async fn backend_health_surfaces_failure() {
        let dir = temp_dir("jobs-health-down");
        let (gateway, _) = spawn_gateway(test_config("http://127.0.0.1:9", &dir)).await;

        let response = reqwest::get(format!("{gateway}/api/health/backend"))
            .await
            .expect("request");
        assert_eq!(response.status().as_u16(), 500);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["error"], "Backend health check failed");
        assert_eq!(body["backend"], "http://127.0.0.1:9");
    }

    #[tokio::test]
    async fn backend_health_relays_backend_document() {
        let backend = serve(jobs_backend()).await;
        let dir = temp_dir("jobs-health");
        let (gateway, _) = spawn_gateway(test_config(&backend, &dir)).await;

        let body: Value = reqwest::get(format!("{gateway}/api/health/backend"))
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        assert_eq!(body["service"], "ocrd");
    }
}
