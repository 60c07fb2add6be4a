use axum::Router;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;

use crate::backend::BackendClient;
use crate::config::GatewayConfig;
use crate::relay::RelayRegistry;
use crate::{build_router, AppState};

pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("{prefix}-{nanos}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub(crate) fn test_config(backend_url: &str, dir: &Path) -> GatewayConfig {
    let upload_dir = dir.join("uploads");
    fs::create_dir_all(&upload_dir).expect("create upload dir");
    GatewayConfig {
        backend_url: backend_url.trim_end_matches('/').to_string(),
        listen_addr: "127.0.0.1:0".to_string(),
        relay_addr: None,
        cors_allowed_origins: vec!["http://localhost:3000".to_string()],
        static_dir: dir.join("build"),
        upload_dir,
        max_upload_bytes: 1024 * 1024,
        upload_retry_delay: Duration::from_millis(20),
    }
}

/// Serves `router` on an ephemeral port and returns its base url.
pub(crate) async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

pub(crate) async fn spawn_gateway(config: GatewayConfig) -> (String, AppState) {
    let state = AppState {
        backend: BackendClient::new(config.backend_url.clone()).expect("backend client"),
        relays: RelayRegistry::new(),
        config: Arc::new(config),
    };
    let url = serve(build_router(state.clone())).await;
    (url, state)
}

pub(crate) fn pdf_bytes(len: usize) -> Vec<u8> {
    let mut bytes = b"%PDF-1.7\n".to_vec();
    bytes.resize(len.max(bytes.len()), b'0');
    bytes
}

pub(crate) fn upload_dir_entries(config_dir: &Path) -> usize {
    fs::read_dir(config_dir.join("uploads"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}
