use anyhow::{bail, Context};
use ocrd_client::poller::POLL_INTERVAL;
use ocrd_client::view::{
    render_progress, render_results, render_trace, render_trace_list, RunPhase, RunView,
};
use ocrd_client::{AnalysisClient, LiveFeed, PollEvent, StatusPoller, StopReason};
use protocol::{AnalysisResult, JobStatus, Settings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cli::{Command, ExportFormat, RunArgs};

const BAR_WIDTH: usize = 30;

pub(crate) enum Follow {
    Poll(Duration),
    Live,
}

pub(crate) async fn execute(client: Arc<AnalysisClient>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Health { backend: false } => {
            let health = client.health().await.context("Gateway health check failed")?;
            println!("gateway {} at {} (backend {})", health.status, health.timestamp, health.backend);
        }
        Command::Health { backend: true } => {
            let health = client
                .backend_health()
                .await
                .context("Backend health check failed")?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Command::Models => {
            let models = client.models().await.context("Failed to fetch models")?;
            if models.openai_models.is_empty() {
                println!("No models advertised");
            }
            for model in &models.openai_models {
                println!("{model}");
            }
        }
        Command::Run(args) => {
            let follow = if args.live {
                Follow::Live
            } else {
                Follow::Poll(POLL_INTERVAL)
            };
            let settings = settings_from(&args);
            let result = run_analysis(&client, &settings, &args.file, !args.skip_model_check, follow)
                .await?;
            println!("{}", render_results(&result));
        }
        Command::Status { job_id } => {
            let status = client
                .job_status(&job_id)
                .await
                .with_context(|| format!("Failed to fetch status for {job_id}"))?;
            println!("{}", render_progress(&status, BAR_WIDTH));
            if let Some(error) = status.error.as_deref() {
                println!("error: {error}");
            }
        }
        Command::Results { job_id } => {
            let result = client
                .results(&job_id)
                .await
                .with_context(|| format!("Failed to fetch results for {job_id}"))?;
            println!("{}", render_results(&result));
        }
        Command::Export {
            job_id,
            format: ExportFormat::Excel,
            out,
        } => {
            let written = client
                .export_excel(&job_id, &out)
                .await
                .context("Excel export failed")?;
            println!("wrote {} ({written} bytes)", out.display());
        }
        Command::Export {
            job_id,
            format: ExportFormat::Json,
            out,
        } => {
            let result = client.export_json(&job_id).await.context("JSON export failed")?;
            client
                .save_json(&result, &out)
                .await
                .context("JSON export failed")?;
            println!("wrote {}", out.display());
        }
        Command::Traces {
            trace_id: None,
            ..
        } => {
            let traces = client.traces().await.context("Failed to list traces")?;
            print!("{}", render_trace_list(&traces));
        }
        Command::Traces {
            trace_id: Some(trace_id),
            file: None,
        } => {
            let trace = client
                .trace(&trace_id)
                .await
                .with_context(|| format!("Failed to fetch trace {trace_id}"))?;
            print!("{}", render_trace(&trace));
        }
        Command::Traces {
            trace_id: Some(trace_id),
            file: Some(file),
        } => {
            let bytes = client
                .trace_file(&trace_id, &file)
                .await
                .with_context(|| format!("Failed to fetch {file} from trace {trace_id}"))?;
            print!("{}", String::from_utf8_lossy(&bytes));
        }
    }
    Ok(())
}

fn settings_from(args: &RunArgs) -> Settings {
    Settings {
        analysis_method: args.method.into(),
        llm_provider: args.provider.into(),
        model: args.model.clone(),
        fund_id: args.fund_id.clone(),
    }
}

/// Validates settings, uploads, starts the job and follows it. Results are
/// fetched once, after a completed status.
pub(crate) async fn run_analysis(
    client: &Arc<AnalysisClient>,
    settings: &Settings,
    file: &Path,
    check_model: bool,
    follow: Follow,
) -> anyhow::Result<AnalysisResult> {
    if check_model {
        let models = client.models().await.context("Failed to fetch models")?;
        settings.ensure_model_advertised(&models)?;
    }
    let receipt = client.upload_file(file).await.context("Upload failed")?;
    println!("uploaded {}", file.display());
    let job = client
        .start_analysis(&settings.analyze_request(receipt.file_path))
        .await
        .context("Analysis failed to start")?;
    println!("job {} started", job.job_id);

    let mut view = RunView::new();
    view.begin(&job.job_id);
    match follow {
        Follow::Poll(interval) => follow_polling(client, &mut view, &job.job_id, interval).await?,
        Follow::Live => {
            if let Err(err) = follow_live(client, &mut view, &job.job_id).await {
                warn!(job_id = %job.job_id, error = %err, "live updates unavailable, polling instead");
                follow_polling(client, &mut view, &job.job_id, POLL_INTERVAL).await?;
            }
        }
    }

    match view.phase() {
        RunPhase::Completed => client
            .results(&job.job_id)
            .await
            .context("Failed to fetch results"),
        RunPhase::Failed => bail!(
            "Analysis failed: {}",
            view.error_message().unwrap_or_default()
        ),
        phase => bail!("status updates stopped while the job was {}", phase.label()),
    }
}

fn show(view: &mut RunView, status: &JobStatus) {
    if view.observe(status) {
        println!("{}", render_progress(status, BAR_WIDTH));
    }
}

async fn follow_polling(
    client: &Arc<AnalysisClient>,
    view: &mut RunView,
    job_id: &str,
    interval: Duration,
) -> anyhow::Result<()> {
    let poller = StatusPoller::new(Arc::clone(client)).with_interval(interval);
    let Some(mut events) = poller.subscribe(job_id) else {
        bail!("job {job_id} already finished");
    };
    while let Some(event) = events.recv().await {
        match event {
            PollEvent::Update(status) => show(view, &status),
            PollEvent::Stopped(StopReason::Terminal(_)) => break,
            PollEvent::Stopped(StopReason::Failed(err)) => {
                return Err(anyhow::Error::new(err).context("Status polling stopped"));
            }
        }
    }
    Ok(())
}

async fn follow_live(
    client: &Arc<AnalysisClient>,
    view: &mut RunView,
    job_id: &str,
) -> anyhow::Result<()> {
    let feed = LiveFeed::new(client.base_url());
    let Some(mut updates) = feed.connect(job_id).await? else {
        bail!("live feed for {job_id} already open");
    };
    while let Some(status) = updates.recv().await {
        show(view, &status);
        if view.phase().is_terminal() {
            break;
        }
    }
    feed.disconnect(job_id);
    if !view.phase().is_terminal() {
        bail!("live feed closed before the job finished");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Multipart, Path as UrlPath};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use ocrd_client::{ClientLogger, LogLevel};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Counters {
        status: Arc<AtomicUsize>,
        results: Arc<AtomicUsize>,
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    fn gateway(counters: Counters, fail_job: bool) -> Router {
        let status_calls = counters.status.clone();
        let results_calls = counters.results.clone();
        Router::new()
            .route(
                "/api/models",
                get(|| async { Json(json!({"openai_models": ["gpt-4o-mini", "gpt-4o"]})) }),
            )
            .route(
                "/api/upload",
                post(|mut multipart: Multipart| async move {
                    while let Ok(Some(_)) = multipart.next_field().await {}
                    Json(json!({"file_path": "/srv/uploads/fund.pdf"}))
                }),
            )
            .route(
                "/api/analyze",
                post(|| async { Json(json!({"job_id": "job-9", "status": "queued"})) }),
            )
            .route(
                "/api/jobs/:job_id/status",
                get(move |UrlPath(job_id): UrlPath<String>| {
                    let calls = status_calls.clone();
                    async move {
                        let call = calls.fetch_add(1, Ordering::SeqCst);
                        let (status, progress) = match call {
                            0 => ("processing", 30),
                            _ if fail_job => ("failed", 30),
                            _ => ("completed", 100),
                        };
                        Json(json!({
                            "job_id": job_id,
                            "status": status,
                            "progress": progress,
                            "message": "",
                            "error": if fail_job { Some("LLM quota exceeded") } else { None }
                        }))
                    }
                }),
            )
            .route(
                "/api/jobs/:job_id/results",
                get(move || {
                    let calls = results_calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        (
                            StatusCode::OK,
                            Json(json!({
                                "sections": {"bond": {"government_bond": {"allowed": true, "note": "", "evidence": {"text": ""}}}},
                                "total_instruments": 1,
                                "allowed_instruments": 1
                            })),
                        )
                    }
                }),
            )
    }

    fn pdf(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("ocrd-run-{name}-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("fund.pdf");
        std::fs::write(&path, b"%PDF-1.4\n%%EOF").expect("pdf");
        path
    }

    fn client(base: &str) -> Arc<AnalysisClient> {
        Arc::new(AnalysisClient::new(base, Arc::new(ClientLogger::new(LogLevel::Warn))).expect("client"))
    }

    #[tokio::test]
    async fn completed_run_fetches_results_once() {
        let counters = Counters::default();
        let base = serve(gateway(counters.clone(), false)).await;
        let client = client(&base);

        let result = run_analysis(
            &client,
            &Settings::default(),
            &pdf("ok"),
            true,
            Follow::Poll(Duration::from_millis(10)),
        )
        .await
        .expect("run");
        assert_eq!(result.total_instruments, 1);
        assert_eq!(counters.status.load(Ordering::SeqCst), 2);
        assert_eq!(counters.results.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_run_reports_error_without_results() {
        let counters = Counters::default();
        let base = serve(gateway(counters.clone(), true)).await;
        let client = client(&base);

        let err = run_analysis(
            &client,
            &Settings::default(),
            &pdf("failed"),
            true,
            Follow::Poll(Duration::from_millis(10)),
        )
        .await
        .expect_err("failed job");
        assert_eq!(err.to_string(), "Analysis failed: LLM quota exceeded");
        assert_eq!(counters.results.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_model_stops_before_upload() {
        let counters = Counters::default();
        let base = serve(gateway(counters.clone(), false)).await;
        let client = client(&base);
        let settings = Settings {
            model: "gpt-unknown".into(),
            ..Settings::default()
        };

        let err = run_analysis(&client, &settings, &pdf("model"), true, Follow::Poll(Duration::from_millis(10)))
            .await
            .expect_err("unknown model");
        assert!(err.to_string().contains("gpt-unknown"));
        assert_eq!(counters.status.load(Ordering::SeqCst), 0);
    }
}
