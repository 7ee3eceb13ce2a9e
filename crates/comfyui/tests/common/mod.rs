//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use meshforge_comfyui::api::{ComfyUIApiError, Transport};
use meshforge_comfyui::client::{ComfyUIClientError, FrameStream, StreamConnector};
use meshforge_comfyui::queue::{QueuePosition, QueueSnapshot};
use meshforge_comfyui::result::JobResult;
use meshforge_comfyui::tracker::{JobObserver, JobOutcome, TrackerConfig};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// In-memory server: hands out `job-N` ids and answers `/history` with
/// whatever result the test has made ready.
#[derive(Default)]
pub struct MockTransport {
    submitted: AtomicUsize,
    submit_errors: Mutex<VecDeque<ComfyUIApiError>>,
    gated: AtomicBool,
    gate: Notify,
    ready: Mutex<Option<JobResult>>,
    fetch_errors: Mutex<VecDeque<ComfyUIApiError>>,
    fetch_calls: Mutex<Vec<Instant>>,
    snapshot: Mutex<Option<QueueSnapshot>>,
    snapshot_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `submit` wait until [`open_gate`](Self::open_gate) is called.
    pub fn hold_submissions(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
        self.gate.notify_one();
    }

    pub fn fail_next_submit(&self, err: ComfyUIApiError) {
        self.submit_errors.lock().unwrap().push_back(err);
    }

    pub fn fail_next_fetch(&self, err: ComfyUIApiError) {
        self.fetch_errors.lock().unwrap().push_back(err);
    }

    /// Make `/history` answer with a finished result for `job_id`.
    pub fn complete(&self, job_id: &str) {
        *self.ready.lock().unwrap() = Some(finished(job_id));
    }

    pub fn complete_with(&self, result: JobResult) {
        *self.ready.lock().unwrap() = Some(result);
    }

    pub fn set_snapshot(&self, snapshot: QueueSnapshot) {
        *self.snapshot.lock().unwrap() = Some(snapshot);
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        self.fetch_calls.lock().unwrap().clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn submit(
        &self,
        _workflow: &serde_json::Value,
        _client_id: &str,
        _timeout: Duration,
    ) -> Result<String, ComfyUIApiError> {
        let n = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if let Some(err) = self.submit_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(format!("job-{n}"))
    }

    async fn fetch_result(
        &self,
        job_id: &str,
        _timeout: Duration,
    ) -> Result<Option<JobResult>, ComfyUIApiError> {
        self.fetch_calls.lock().unwrap().push(Instant::now());
        if let Some(err) = self.fetch_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self
            .ready
            .lock()
            .unwrap()
            .clone()
            .filter(|r| r.job_id == job_id))
    }

    async fn fetch_queue_snapshot(
        &self,
        _timeout: Duration,
    ) -> Result<QueueSnapshot, ComfyUIApiError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.snapshot.lock().unwrap().clone().unwrap_or_default())
    }
}

/// A successful history entry with one image output.
pub fn finished(job_id: &str) -> JobResult {
    let body = serde_json::json!({
        job_id: {
            "outputs": {"9": {"images": [{"filename": "out.png", "subfolder": "", "type": "output"}]}},
            "status": {"status_str": "success", "completed": true, "messages": []}
        }
    });
    JobResult::from_history(job_id, body).unwrap().unwrap()
}

/// Tracker settings with short deadlines for paused-clock tests.
pub fn fast_config(poll_interval: Duration, job_timeout: Duration) -> TrackerConfig {
    TrackerConfig {
        poll_interval,
        request_timeout: Duration::from_secs(5),
        light_job_timeout: job_timeout,
        heavy_job_timeout: job_timeout * 5,
    }
}

// ---------------------------------------------------------------------------
// Stream connector
// ---------------------------------------------------------------------------

/// One scripted connection attempt.
pub enum Session {
    Refuse,
    /// Deliver these frames, then close.
    Frames(Vec<String>),
    /// Deliver these frames, then stay open until stopped.
    FramesThenHold(Vec<String>),
}

/// Plays back scripted sessions; refuses once the script runs out.
/// Reports the time of every attempt on `attempts`.
pub struct ScriptedConnector {
    sessions: Mutex<VecDeque<Session>>,
    attempts: mpsc::UnboundedSender<(String, Instant)>,
}

impl ScriptedConnector {
    pub fn new(sessions: Vec<Session>) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Instant)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            attempts: tx,
        });
        (connector, rx)
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(&self, client_id: &str) -> Result<FrameStream, ComfyUIClientError> {
        let _ = self.attempts.send((client_id.to_string(), Instant::now()));
        let session = self.sessions.lock().unwrap().pop_front();
        match session {
            None | Some(Session::Refuse) => {
                Err(ComfyUIClientError::Connection("connection refused".into()))
            }
            Some(Session::Frames(frames)) => {
                Ok(futures::stream::iter(frames.into_iter().map(Ok)).boxed())
            }
            Some(Session::FramesThenHold(frames)) => Ok(futures::stream::iter(
                frames.into_iter().map(Ok),
            )
            .chain(futures::stream::pending())
            .boxed()),
        }
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Records every callback for later assertions.
#[derive(Default)]
pub struct RecordingObserver {
    pub statuses: Mutex<Vec<String>>,
    pub depths: Mutex<Vec<u32>>,
    pub positions: Mutex<Vec<QueuePosition>>,
    pub started: Mutex<Vec<String>>,
    pub nodes: Mutex<Vec<(String, String)>>,
    pub progress: Mutex<Vec<(u32, u32)>>,
    pub terminal: Mutex<Vec<Result<String, String>>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl JobObserver for RecordingObserver {
    fn on_status(&self, text: &str) {
        self.statuses.lock().unwrap().push(text.to_string());
    }

    fn on_queue_depth(&self, queue_remaining: u32) {
        self.depths.lock().unwrap().push(queue_remaining);
    }

    fn on_queue_position(&self, _job_id: &str, position: QueuePosition) {
        self.positions.lock().unwrap().push(position);
    }

    fn on_job_started(&self, job_id: &str) {
        self.started.lock().unwrap().push(job_id.to_string());
    }

    fn on_node_executing(&self, node_id: &str, job_id: &str) {
        self.nodes
            .lock()
            .unwrap()
            .push((node_id.to_string(), job_id.to_string()));
    }

    fn on_progress(&self, value: u32, max: u32) {
        self.progress.lock().unwrap().push((value, max));
    }

    fn on_job_terminal(&self, outcome: &JobOutcome) {
        let summary = match outcome {
            Ok(result) => Ok(result.job_id.clone()),
            Err(e) => Err(e.to_string()),
        };
        self.terminal.lock().unwrap().push(summary);
    }
}
