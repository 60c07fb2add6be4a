use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ocrd-gateway",
    version,
    about = "Reverse proxy in front of the OCRD analysis backend"
)]
pub(crate) struct Args {
    #[arg(long, env = "PYTHON_BACKEND_URL", default_value = "http://localhost:8000")]
    pub(crate) backend_url: String,
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub(crate) host: String,
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub(crate) port: u16,
    /// Extra listener dedicated to the job WebSocket relay; 0 disables it.
    #[arg(long, env = "WS_RELAY_PORT", default_value_t = 8080)]
    pub(crate) ws_relay_port: u16,
    #[arg(
        long,
        env = "CORS_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "https://dje-1-4.onrender.com,http://localhost:3000"
    )]
    pub(crate) cors_allowed_origins: Vec<String>,
    #[arg(long, env = "STATIC_DIR", default_value = "frontend/build")]
    pub(crate) static_dir: PathBuf,
    #[arg(long, env = "UPLOAD_DIR", default_value = "uploads")]
    pub(crate) upload_dir: PathBuf,
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 50 * 1024 * 1024)]
    pub(crate) max_upload_bytes: u64,
    #[arg(long, env = "UPLOAD_RETRY_DELAY_MS", default_value_t = 5000)]
    pub(crate) upload_retry_delay_ms: u64,
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub(crate) log_level: String,
    #[arg(long, env = "LOG_DIR")]
    pub(crate) log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
}
