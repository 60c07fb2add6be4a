use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::jobs::path_segment;
use crate::AppState;

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub(crate) struct RelayEntry {
    pub(crate) job_id: String,
    pub(crate) opened_at: SystemTime,
}

/// Live relay pairs, keyed by connection id. Created once at startup and
/// shared through router state.
#[derive(Clone, Default)]
pub(crate) struct RelayRegistry {
    inner: Arc<RwLock<HashMap<String, RelayEntry>>>,
}

impl RelayRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn register(&self, job_id: &str) -> String {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let mut guard = self.inner.write().await;
        guard.insert(
            connection_id.clone(),
            RelayEntry {
                job_id: job_id.to_string(),
                opened_at: SystemTime::now(),
            },
        );
        connection_id
    }

    pub(crate) async fn remove(&self, connection_id: &str) -> Option<RelayEntry> {
        let mut guard = self.inner.write().await;
        guard.remove(connection_id)
    }

    pub(crate) async fn active_for(&self, job_id: &str) -> usize {
        let guard = self.inner.read().await;
        guard.values().filter(|entry| entry.job_id == job_id).count()
    }

    pub(crate) async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Router for the dedicated relay listener.
pub(crate) fn relay_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/jobs/:job_id", get(relay_handler))
        .layer(middleware::from_fn(crate::request_context))
        .with_state(state)
}

pub(crate) async fn relay_handler(
    ws: WebSocketUpgrade,
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if let Err(err) = path_segment("job id", &job_id) {
        return err.into_response();
    }
    ws.on_upgrade(move |socket| relay_job(socket, job_id, state))
}

async fn relay_job(mut client: WebSocket, job_id: String, state: AppState) {
    let backend_url = state.backend.ws_url(&job_id);
    let backend = match tokio_tungstenite::connect_async(backend_url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            warn!(job_id = %job_id, url = %backend_url, error = %err, "backend websocket connect failed");
            let _ = client.send(Message::Close(None)).await;
            return;
        }
    };
    let connection_id = state.relays.register(&job_id).await;
    let active = state.relays.active_for(&job_id).await;
    let total = state.relays.len().await;
    info!(
        job_id = %job_id,
        connection_id = %connection_id,
        active,
        total,
        "websocket relay opened"
    );

    pipe(client, backend, &job_id).await;

    if let Some(entry) = state.relays.remove(&connection_id).await {
        let open_for = entry.opened_at.elapsed().unwrap_or_default();
        info!(
            job_id = %entry.job_id,
            connection_id = %connection_id,
            open_for = %humantime::format_duration(open_for),
            "websocket relay closed"
        );
    }
}

/// Copies frames both ways until either side closes, then closes the other.
async fn pipe(client: WebSocket, backend: BackendSocket, job_id: &str) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();
    loop {
        tokio::select! {
            message = backend_rx.next() => {
                let forwarded = match message {
                    Some(Ok(BackendMessage::Text(text))) => Message::Text(text),
                    Some(Ok(BackendMessage::Binary(data))) => Message::Binary(data),
                    Some(Ok(BackendMessage::Close(_))) | None => {
                        let _ = client_tx.send(Message::Close(None)).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(job_id = %job_id, error = %err, "backend websocket error");
                        let _ = client_tx.send(Message::Close(None)).await;
                        break;
                    }
                };
                if client_tx.send(forwarded).await.is_err() {
                    let _ = backend_tx.send(BackendMessage::Close(None)).await;
                    break;
                }
            }
            message = client_rx.next() => {
                let forwarded = match message {
                    Some(Ok(Message::Text(text))) => BackendMessage::Text(text),
                    Some(Ok(Message::Binary(data))) => BackendMessage::Binary(data),
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = backend_tx.send(BackendMessage::Close(None)).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(job_id = %job_id, error = %err, "client websocket error");
                        let _ = backend_tx.send(BackendMessage::Close(None)).await;
                        break;
                    }
                };
                if backend_tx.send(forwarded).await.is_err() {
                    let _ = client_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
}
