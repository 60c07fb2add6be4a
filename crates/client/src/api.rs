use futures_util::StreamExt;
use protocol::{
    AnalysisResult, AnalyzeRequest, GatewayHealth, JobDescriptor, JobStatus, ModelList, TraceList,
    TraceSummary, UploadReceipt,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::ClientError;
use crate::logger::ClientLogger;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const ANALYZE_TIMEOUT: Duration = Duration::from_secs(120);
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
pub const RESULTS_TIMEOUT: Duration = Duration::from_secs(30);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const PDF_MAGIC: &[u8] = b"%PDF-";

enum Payload {
    Empty,
    Json(Value),
    Multipart { form: Form, summary: Value },
}

/// Typed access to the gateway `/api` surface.
pub struct AnalysisClient {
    http: Client,
    base_url: String,
    logger: Arc<ClientLogger>,
}

impl AnalysisClient {
    pub fn new(base_url: &str, logger: Arc<ClientLogger>) -> Result<Self, ClientError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ClientError::Request(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            logger,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn logger(&self) -> &Arc<ClientLogger> {
        &self.logger
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health(&self) -> Result<GatewayHealth, ClientError> {
        self.get_json("/api/health", HEALTH_TIMEOUT).await
    }

    pub async fn backend_health(&self) -> Result<Value, ClientError> {
        self.get_json("/api/health/backend", HEALTH_TIMEOUT).await
    }

    pub async fn models(&self) -> Result<ModelList, ClientError> {
        self.get_json("/api/models", DEFAULT_TIMEOUT).await
    }

    /// Uploads a PDF. Anything that is not a PDF by extension and by content
    /// is rejected before a request is made.
    pub async fn upload_file(&self, path: &Path) -> Result<UploadReceipt, ClientError> {
        let file_name = pdf_file_name(path)?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| ClientError::Io(format!("failed to read {}: {err}", path.display())))?;
        if !bytes.starts_with(PDF_MAGIC) {
            return Err(ClientError::InvalidInput(format!(
                "{} is not a PDF document",
                path.display()
            )));
        }
        let size = bytes.len();
        let part = Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str("application/pdf")
            .map_err(|err| ClientError::Request(err.to_string()))?;
        let payload = Payload::Multipart {
            form: Form::new().part("file", part),
            summary: json!({ "file": { "name": file_name, "size": size, "type": "application/pdf" } }),
        };
        let (response, call) = self
            .dispatch(Method::POST, "/api/upload", UPLOAD_TIMEOUT, payload)
            .await?;
        self.finish_json(response, call).await
    }

    pub async fn start_analysis(
        &self,
        request: &AnalyzeRequest,
    ) -> Result<JobDescriptor, ClientError> {
        let body = serde_json::to_value(request)
            .map_err(|err| ClientError::Request(err.to_string()))?;
        let (response, call) = self
            .dispatch(Method::POST, "/api/analyze", ANALYZE_TIMEOUT, Payload::Json(body))
            .await?;
        self.finish_json(response, call).await
    }

    pub async fn job_status(&self, job_id: &str) -> Result<JobStatus, ClientError> {
        let job_id = segment("job id", job_id)?;
        self.get_json(&format!("/api/jobs/{job_id}/status"), STATUS_TIMEOUT)
            .await
    }

    pub async fn results(&self, job_id: &str) -> Result<AnalysisResult, ClientError> {
        let job_id = segment("job id", job_id)?;
        self.get_json(&format!("/api/jobs/{job_id}/results"), RESULTS_TIMEOUT)
            .await
    }

    /// Streams the workbook to `dest` and returns the number of bytes written.
    pub async fn export_excel(&self, job_id: &str, dest: &Path) -> Result<u64, ClientError> {
        let job_id = segment("job id", job_id)?;
        let (response, call) = self
            .dispatch(
                Method::GET,
                &format!("/api/jobs/{job_id}/export/excel"),
                DEFAULT_TIMEOUT,
                Payload::Empty,
            )
            .await?;
        let status = response.status().as_u16();
        let written = match self.write_body(response, dest, &call).await {
            Ok(written) => written,
            Err(err) => {
                if let Err(remove) = tokio::fs::remove_file(dest).await {
                    debug!(file = %dest.display(), error = %remove, "no partial export to remove");
                }
                return Err(err);
            }
        };
        self.logger.log_response(
            &call.request_id,
            call.method.as_str(),
            &call.url,
            status,
            Some(&json!({ "bytes": written, "file": dest.display().to_string() })),
            call.started.elapsed(),
        );
        Ok(written)
    }

    async fn write_body(
        &self,
        response: Response,
        dest: &Path,
        call: &Call,
    ) -> Result<u64, ClientError> {
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|err| ClientError::Io(format!("failed to create {}: {err}", dest.display())))?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| self.fail(call, ClientError::from_transport(&err)))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    pub async fn export_json(&self, job_id: &str) -> Result<AnalysisResult, ClientError> {
        let job_id = segment("job id", job_id)?;
        self.get_json(&format!("/api/jobs/{job_id}/export/json"), DEFAULT_TIMEOUT)
            .await
    }

    pub async fn save_json(&self, result: &AnalysisResult, dest: &Path) -> Result<(), ClientError> {
        let text = serde_json::to_string_pretty(result)
            .map_err(|err| ClientError::Decode(err.to_string()))?;
        tokio::fs::write(dest, text)
            .await
            .map_err(|err| ClientError::Io(format!("failed to write {}: {err}", dest.display())))?;
        self.logger.info(
            "results saved",
            Some(json!({ "file": dest.display().to_string() })),
        );
        Ok(())
    }

    pub async fn traces(&self) -> Result<TraceList, ClientError> {
        self.get_json("/api/traces", DEFAULT_TIMEOUT).await
    }

    pub async fn trace(&self, trace_id: &str) -> Result<TraceSummary, ClientError> {
        let trace_id = segment("trace id", trace_id)?;
        self.get_json(&format!("/api/traces/{trace_id}"), DEFAULT_TIMEOUT)
            .await
    }

    pub async fn trace_file(&self, trace_id: &str, filename: &str) -> Result<Vec<u8>, ClientError> {
        let trace_id = segment("trace id", trace_id)?;
        let filename = segment("file name", filename)?;
        let (response, call) = self
            .dispatch(
                Method::GET,
                &format!("/api/traces/{trace_id}/files/{filename}"),
                DEFAULT_TIMEOUT,
                Payload::Empty,
            )
            .await?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| self.fail(&call, ClientError::from_transport(&err)))?;
        self.logger.log_response(
            &call.request_id,
            call.method.as_str(),
            &call.url,
            status,
            Some(&json!({ "bytes": bytes.len() })),
            call.started.elapsed(),
        );
        Ok(bytes.to_vec())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let (response, call) = self
            .dispatch(Method::GET, path, timeout, Payload::Empty)
            .await?;
        self.finish_json(response, call).await
    }

    /// Sends one request with a fresh request id. Non-2xx answers and
    /// transport failures are logged and returned as errors.
    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        timeout: Duration,
        payload: Payload,
    ) -> Result<(Response, Call), ClientError> {
        let call = Call {
            request_id: new_request_id(),
            method: method.clone(),
            url: self.url(path),
            started: Instant::now(),
        };
        let mut headers = vec![(REQUEST_ID_HEADER.to_string(), call.request_id.clone())];
        let mut builder = self
            .http
            .request(method, &call.url)
            .header(REQUEST_ID_HEADER, &call.request_id)
            .timeout(timeout);
        let logged_body = match payload {
            Payload::Empty => None,
            Payload::Json(body) => {
                headers.push(("content-type".to_string(), "application/json".to_string()));
                builder = builder.json(&body);
                Some(body)
            }
            Payload::Multipart { form, summary } => {
                headers.push(("content-type".to_string(), "multipart/form-data".to_string()));
                builder = builder.multipart(form);
                Some(summary)
            }
        };
        self.logger.log_request(
            &call.request_id,
            call.method.as_str(),
            &call.url,
            &headers,
            logged_body.as_ref(),
        );

        let response = builder
            .send()
            .await
            .map_err(|err| self.fail(&call, ClientError::from_transport(&err)))?;
        let status = response.status();
        if status.is_success() {
            return Ok((response, call));
        }
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&text).ok().or_else(|| {
            (!text.trim().is_empty()).then(|| Value::String(text.clone()))
        });
        Err(self.fail(
            &call,
            ClientError::from_status(status.as_u16(), status.canonical_reason(), body),
        ))
    }

    async fn finish_json<T: DeserializeOwned>(
        &self,
        response: Response,
        call: Call,
    ) -> Result<T, ClientError> {
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|err| self.fail(&call, ClientError::from_transport(&err)))?;
        let value: Value = serde_json::from_str(&text).map_err(|err| {
            self.fail(
                &call,
                ClientError::Decode(format!("response is not JSON: {err}")),
            )
        })?;
        self.logger.log_response(
            &call.request_id,
            call.method.as_str(),
            &call.url,
            status,
            Some(&value),
            call.started.elapsed(),
        );
        serde_json::from_value(value).map_err(|err| {
            self.fail(
                &call,
                ClientError::Decode(format!("unexpected response shape: {err}")),
            )
        })
    }

    fn fail(&self, call: &Call, error: ClientError) -> ClientError {
        self.logger.log_error(
            &call.request_id,
            call.method.as_str(),
            &call.url,
            &error,
            call.started.elapsed(),
        );
        error
    }
}

struct Call {
    request_id: String,
    method: Method,
    url: String,
    started: Instant,
}

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

fn pdf_file_name(path: &Path) -> Result<String, ClientError> {
    let is_pdf = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
    if !is_pdf {
        return Err(ClientError::InvalidInput(
            "Only PDF files are allowed".to_string(),
        ));
    }
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| ClientError::InvalidInput(format!("invalid file name: {}", path.display())))
}

fn segment<'a>(kind: &str, value: &'a str) -> Result<&'a str, ClientError> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid {
        Ok(value)
    } else {
        Err(ClientError::InvalidInput(format!("invalid {kind}: {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogLevel;
    use crate::test_support::{serve, temp_dir};
    use axum::body::{Body, Bytes};
    use axum::extract::{Multipart, Path as UrlPath};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client(base: &str) -> AnalysisClient {
        AnalysisClient::new(base, Arc::new(ClientLogger::new(LogLevel::Debug))).expect("client")
    }

    fn results_document() -> Value {
        json!({
            "sections": {
                "bond": {
                    "government_bond": {"allowed": true, "confidence": 0.92, "note": "", "evidence": {"text": "may invest", "page": 4}}
                }
            },
            "total_instruments": 1,
            "allowed_instruments": 1,
            "evidence_coverage": 100.0,
            "confidence_score": 0.92,
            "processing_time": 12.5
        })
    }

    fn gateway(uploads: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/api/health",
                get(|headers: HeaderMap| async move {
                    let request_id = headers
                        .get(REQUEST_ID_HEADER)
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({
                        "status": "healthy",
                        "timestamp": "2026-01-01T00:00:00Z",
                        "backend": request_id
                    }))
                }),
            )
            .route(
                "/api/upload",
                post(move |mut multipart: Multipart| {
                    let uploads = uploads.clone();
                    async move {
                        uploads.fetch_add(1, Ordering::SeqCst);
                        let mut name = String::new();
                        while let Ok(Some(field)) = multipart.next_field().await {
                            name = field.file_name().unwrap_or_default().to_string();
                        }
                        Json(json!({"file_path": format!("/srv/uploads/{name}"), "filename": name}))
                    }
                }),
            )
            .route(
                "/api/analyze",
                post(|Json(body): Json<Value>| async move {
                    if body["model"] == "broken" {
                        return (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(json!({"detail": "Analysis failed to start"})),
                        );
                    }
                    (StatusCode::OK, Json(json!({"job_id": "job-1", "status": "queued"})))
                }),
            )
            .route(
                "/api/jobs/:job_id/status",
                get(|UrlPath(job_id): UrlPath<String>| async move {
                    Json(json!({"job_id": job_id, "status": "processing", "progress": 55, "message": "Working"}))
                }),
            )
            .route(
                "/api/jobs/:job_id/results",
                get(|UrlPath(job_id): UrlPath<String>| async move {
                    if job_id == "bad" {
                        return Json(json!({"sections": {"bond": {"x": {"allowed": "yes"}}}}));
                    }
                    Json(results_document())
                }),
            )
            .route(
                "/api/jobs/:job_id/export/excel",
                get(|UrlPath(job_id): UrlPath<String>| async move {
                    if job_id != "cut" {
                        return Body::from(vec![0x50u8, 0x4b, 0x03, 0x04]);
                    }
                    let head = stream::once(async { Ok(Bytes::from_static(b"PK\x03\x04")) });
                    let tail = stream::once(async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(std::io::Error::other("workbook generation aborted"))
                    });
                    Body::from_stream(head.chain(tail))
                }),
            )
            .route(
                "/api/traces/:trace_id/files/:filename",
                get(|| async { "prompt text" }),
            )
    }

    #[tokio::test]
    async fn sends_request_id_and_logs_call() {
        let base = serve(gateway(Arc::new(AtomicUsize::new(0)))).await;
        let api = client(&base);
        let health = api.health().await.expect("health");
        assert!(health.backend.starts_with("req_"));

        let entries = api.logger().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].request_id.as_deref(), Some(health.backend.as_str()));
        assert_eq!(entries[1].request_id, entries[0].request_id);
        let context = entries[1].context.as_ref().expect("context");
        assert_eq!(context["status"], 200);
    }

    #[tokio::test]
    async fn rejects_non_pdf_without_network() {
        let uploads = Arc::new(AtomicUsize::new(0));
        let base = serve(gateway(uploads.clone())).await;
        let api = client(&base);
        let dir = temp_dir("non-pdf");

        let text = dir.join("notes.txt");
        std::fs::write(&text, "%PDF-1.4 but wrong extension").expect("write");
        let err = api.upload_file(&text).await.expect_err("extension");
        assert_eq!(err, ClientError::InvalidInput("Only PDF files are allowed".into()));

        let fake = dir.join("fake.pdf");
        std::fs::write(&fake, "plain text").expect("write");
        let err = api.upload_file(&fake).await.expect_err("magic");
        assert!(matches!(err, ClientError::InvalidInput(_)));

        assert_eq!(uploads.load(Ordering::SeqCst), 0);
        assert!(api.logger().entries().is_empty());
    }

    #[tokio::test]
    async fn uploads_pdf_and_starts_analysis() {
        let uploads = Arc::new(AtomicUsize::new(0));
        let base = serve(gateway(uploads.clone())).await;
        let api = client(&base);
        let dir = temp_dir("upload");
        let pdf = dir.join("Fund Prospectus.PDF");
        std::fs::write(&pdf, b"%PDF-1.7\n%%EOF").expect("write");

        let receipt = api.upload_file(&pdf).await.expect("upload");
        assert_eq!(receipt.file_path, "/srv/uploads/Fund Prospectus.PDF");
        assert_eq!(uploads.load(Ordering::SeqCst), 1);

        let request = protocol::Settings::default().analyze_request(receipt.file_path);
        let job = api.start_analysis(&request).await.expect("analyze");
        assert_eq!(job.job_id, "job-1");
    }

    #[tokio::test]
    async fn backend_detail_becomes_error_message() {
        let base = serve(gateway(Arc::new(AtomicUsize::new(0)))).await;
        let api = client(&base);
        let mut request = protocol::Settings::default().analyze_request("/srv/uploads/a.pdf");
        request.model = "broken".into();

        let err = api.start_analysis(&request).await.expect_err("500");
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.message(), "Analysis failed to start");
        let last = api.logger().entries().pop().expect("entry");
        assert_eq!(last.level, LogLevel::Error);
    }

    #[tokio::test]
    async fn unreachable_gateway_reports_no_response() {
        let api = client("http://127.0.0.1:9");
        let err = api.job_status("abc").await.expect_err("down");
        assert!(matches!(err, ClientError::NoResponse(_)), "{err:?}");
    }

    #[tokio::test]
    async fn results_are_schema_checked() {
        let base = serve(gateway(Arc::new(AtomicUsize::new(0)))).await;
        let api = client(&base);

        let result = api.results("job-1").await.expect("results");
        let record = result.instrument("bond", "government_bond").expect("record");
        assert_eq!(record.allowed, Some(true));
        assert_eq!(record.evidence.page, Some(4));

        let err = api.results("bad").await.expect_err("invalid");
        assert!(matches!(err, ClientError::Decode(_)));
    }

    #[tokio::test]
    async fn invalid_ids_never_reach_the_network() {
        let api = client("http://127.0.0.1:9");
        let err = api.job_status("../etc").await.expect_err("invalid");
        assert!(matches!(err, ClientError::InvalidInput(_)));
        assert!(api.logger().entries().is_empty());
    }

    #[tokio::test]
    async fn exports_excel_and_json_to_files() {
        let base = serve(gateway(Arc::new(AtomicUsize::new(0)))).await;
        let api = client(&base);
        let dir = temp_dir("export");

        let xlsx = dir.join("results.xlsx");
        let written = api.export_excel("job-1", &xlsx).await.expect("excel");
        assert_eq!(written, 4);
        assert_eq!(std::fs::read(&xlsx).expect("read"), vec![0x50, 0x4b, 0x03, 0x04]);

        let result = api.results("job-1").await.expect("results");
        let json_path = dir.join("results.json");
        api.save_json(&result, &json_path).await.expect("save");
        let saved: AnalysisResult =
            serde_json::from_str(&std::fs::read_to_string(&json_path).expect("read")).expect("parse");
        assert_eq!(saved, result);
    }

    #[tokio::test]
    async fn interrupted_excel_export_leaves_no_file() {
        let base = serve(gateway(Arc::new(AtomicUsize::new(0)))).await;
        let api = client(&base);
        let dir = temp_dir("export-cut");

        let xlsx = dir.join("results.xlsx");
        api.export_excel("cut", &xlsx).await.expect_err("interrupted");
        assert!(!xlsx.exists());
    }

    #[tokio::test]
    async fn fetches_trace_file_bytes() {
        let base = serve(gateway(Arc::new(AtomicUsize::new(0)))).await;
        let api = client(&base);
        let bytes = api.trace_file("t-1", "prompt.txt").await.expect("file");
        assert_eq!(bytes, b"prompt text");
    }
}
