use async_trait::async_trait;
use protocol::{JobState, JobStatus};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::AnalysisClient;
use crate::error::ClientError;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Where job status snapshots come from.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn fetch_status(&self, job_id: &str) -> Result<JobStatus, ClientError>;
}

#[async_trait]
impl StatusSource for AnalysisClient {
    async fn fetch_status(&self, job_id: &str) -> Result<JobStatus, ClientError> {
        self.job_status(job_id).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Terminal(JobState),
    Failed(ClientError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Update(JobStatus),
    Stopped(StopReason),
}

struct PollLoop {
    generation: u64,
    handle: JoinHandle<()>,
}

type Loops = Arc<Mutex<HashMap<String, PollLoop>>>;
type Finished = Arc<Mutex<HashSet<String>>>;

/// Runs at most one status loop per job id.
///
/// A loop polls immediately, then on every interval tick. It ends on the
/// first terminal status, after which the job id is never polled again, or
/// on the first error, after which a new subscription may be made.
pub struct StatusPoller<S: StatusSource> {
    source: Arc<S>,
    interval: Duration,
    loops: Loops,
    finished: Finished,
    generation: AtomicU64,
}

impl<S: StatusSource> StatusPoller<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            interval: POLL_INTERVAL,
            loops: Arc::new(Mutex::new(HashMap::new())),
            finished: Arc::new(Mutex::new(HashSet::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Starts polling `job_id`, replacing any loop already running for it.
    /// Returns `None` once the job has reached a terminal state.
    pub fn subscribe(&self, job_id: &str) -> Option<mpsc::UnboundedReceiver<PollEvent>> {
        if self.has_finished(job_id) {
            debug!(job_id = %job_id, "job already finished, not polling");
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let mut loops = lock(&self.loops);
        if let Some(previous) = loops.remove(job_id) {
            debug!(job_id = %job_id, "replacing existing poll loop");
            previous.handle.abort();
        }
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.source),
            job_id.to_string(),
            self.interval,
            tx,
            generation,
            Arc::clone(&self.loops),
            Arc::clone(&self.finished),
        ));
        loops.insert(job_id.to_string(), PollLoop { generation, handle });
        info!(job_id = %job_id, interval = ?self.interval, "status polling started");
        Some(rx)
    }

    pub fn unsubscribe(&self, job_id: &str) -> bool {
        match lock(&self.loops).remove(job_id) {
            Some(entry) => {
                entry.handle.abort();
                info!(job_id = %job_id, "status polling cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self, job_id: &str) -> bool {
        lock(&self.loops)
            .get(job_id)
            .is_some_and(|entry| !entry.handle.is_finished())
    }

    pub fn active_count(&self) -> usize {
        lock(&self.loops)
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .count()
    }

    pub fn has_finished(&self, job_id: &str) -> bool {
        lock(&self.finished).contains(job_id)
    }
}

impl<S: StatusSource> Drop for StatusPoller<S> {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.loops).drain() {
            entry.handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn poll_loop<S: StatusSource>(
    source: Arc<S>,
    job_id: String,
    interval: Duration,
    tx: mpsc::UnboundedSender<PollEvent>,
    generation: u64,
    loops: Loops,
    finished: Finished,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match source.fetch_status(&job_id).await {
            Ok(status) => {
                let state = status.status;
                debug!(job_id = %job_id, status = state.as_str(), progress = status.progress, "status polled");
                if tx.send(PollEvent::Update(status)).is_err() {
                    debug!(job_id = %job_id, "status receiver dropped");
                    break;
                }
                if state.is_terminal() {
                    lock(&finished).insert(job_id.clone());
                    info!(job_id = %job_id, status = state.as_str(), "status polling finished");
                    let _ = tx.send(PollEvent::Stopped(StopReason::Terminal(state)));
                    break;
                }
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "status polling stopped on error");
                let _ = tx.send(PollEvent::Stopped(StopReason::Failed(err)));
                break;
            }
        }
    }
    let mut loops = lock(&loops);
    if loops
        .get(&job_id)
        .is_some_and(|entry| entry.generation == generation)
    {
        loops.remove(&job_id);
    }
}
