use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::cli::Args;

#[derive(Debug, Clone)]
pub(crate) struct GatewayConfig {
    pub(crate) backend_url: String,
    pub(crate) listen_addr: String,
    pub(crate) relay_addr: Option<String>,
    pub(crate) cors_allowed_origins: Vec<String>,
    pub(crate) static_dir: PathBuf,
    pub(crate) upload_dir: PathBuf,
    pub(crate) max_upload_bytes: u64,
    pub(crate) upload_retry_delay: Duration,
}

impl GatewayConfig {
    pub(crate) fn from_args(args: &Args) -> anyhow::Result<Self> {
        let backend_url = normalize_backend_url(&args.backend_url)?;
        if args.max_upload_bytes == 0 {
            anyhow::bail!("max upload size must be greater than zero");
        }
        let relay_addr = match args.ws_relay_port {
            0 => None,
            port if port == args.port => {
                anyhow::bail!("ws relay port {port} collides with the http port")
            }
            port => Some(format!("{}:{}", args.host, port)),
        };
        let cors_allowed_origins = args
            .cors_allowed_origins
            .iter()
            .map(|origin| origin.trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .collect();
        Ok(Self {
            backend_url,
            listen_addr: format!("{}:{}", args.host, args.port),
            relay_addr,
            cors_allowed_origins,
            static_dir: args.static_dir.clone(),
            upload_dir: args.upload_dir.clone(),
            max_upload_bytes: args.max_upload_bytes,
            upload_retry_delay: Duration::from_millis(args.upload_retry_delay_ms),
        })
    }
}

fn normalize_backend_url(raw: &str) -> anyhow::Result<String> {
    let trimmed = raw.trim();
    let parsed =
        Url::parse(trimmed).with_context(|| format!("invalid backend url {trimmed}"))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => anyhow::bail!("backend url must use http or https, got {other}"),
    }
    if parsed.host_str().is_none() {
        anyhow::bail!("backend url {trimmed} has no host");
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}
