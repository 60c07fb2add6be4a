use futures_util::{SinkExt, StreamExt};
use protocol::JobStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::ClientError;

struct Subscription {
    generation: u64,
    abort: AbortHandle,
}

type Subscriptions = Arc<Mutex<HashMap<String, Subscription>>>;
type FeedSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Push-based job status over the gateway WebSocket relay.
///
/// At most one socket is open per job id. A socket ends when the relay
/// closes it, on a transport error, or after a terminal status.
pub struct LiveFeed {
    ws_base: String,
    subscriptions: Subscriptions,
    generation: AtomicU64,
}

impl LiveFeed {
    pub fn new(gateway_url: &str) -> Self {
        let trimmed = gateway_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            trimmed.to_string()
        };
        Self {
            ws_base,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn ws_url(&self, job_id: &str) -> String {
        format!("{}/ws/jobs/{job_id}", self.ws_base)
    }

    /// Opens the socket for `job_id`. Returns `Ok(None)` when one is
    /// already open.
    pub async fn connect(
        &self,
        job_id: &str,
    ) -> Result<Option<mpsc::UnboundedReceiver<JobStatus>>, ClientError> {
        if self.is_connected(job_id) {
            debug!(job_id = %job_id, "live feed already open");
            return Ok(None);
        }
        let url = self.ws_url(job_id);
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| {
                warn!(job_id = %job_id, url = %url, error = %err, "live feed connect failed");
                ClientError::NoResponse(format!("WebSocket connect failed: {err}"))
            })?;

        let mut subscriptions = lock(&self.subscriptions);
        if subscriptions.contains_key(job_id) {
            debug!(job_id = %job_id, "live feed opened concurrently, dropping duplicate");
            return Ok(None);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(read_feed(
            stream,
            job_id.to_string(),
            tx,
            generation,
            Arc::clone(&self.subscriptions),
        ));
        subscriptions.insert(
            job_id.to_string(),
            Subscription {
                generation,
                abort: task.abort_handle(),
            },
        );
        info!(job_id = %job_id, url = %url, "live feed connected");
        Ok(Some(rx))
    }

    pub fn disconnect(&self, job_id: &str) -> bool {
        match lock(&self.subscriptions).remove(job_id) {
            Some(subscription) => {
                subscription.abort.abort();
                info!(job_id = %job_id, "live feed disconnected");
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, job_id: &str) -> bool {
        lock(&self.subscriptions)
            .get(job_id)
            .is_some_and(|subscription| !subscription.abort.is_finished())
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        for (_, subscription) in lock(&self.subscriptions).drain() {
            subscription.abort.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_feed(
    mut stream: FeedSocket,
    job_id: String,
    tx: mpsc::UnboundedSender<JobStatus>,
    generation: u64,
    subscriptions: Subscriptions,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<JobStatus>(&text) {
                Ok(status) => {
                    let terminal = status.is_terminal();
                    if tx.send(status).is_err() || terminal {
                        let _ = stream.send(Message::Close(None)).await;
                        break;
                    }
                }
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "dropping unparseable live update");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_))
            | Ok(Message::Ping(_))
            | Ok(Message::Pong(_))
            | Ok(Message::Frame(_)) => {}
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "live feed error");
                break;
            }
        }
    }
    let mut subscriptions = lock(&subscriptions);
    if subscriptions
        .get(&job_id)
        .is_some_and(|subscription| subscription.generation == generation)
    {
        subscriptions.remove(&job_id);
    }
    debug!(job_id = %job_id, "live feed closed");
}
