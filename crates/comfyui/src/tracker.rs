//! Lifecycle tracking for one submitted job.
//!
//! [`JobTracker`] submits a workflow, then waits for whichever of two
//! signals shows completion first:
//!
//! * an [`ExecutionIdle`](StreamEvent::ExecutionIdle) notification for
//!   the job arriving on the event stream, which triggers an immediate
//!   result fetch, or
//! * a non-empty answer from the fixed-interval `/history` poll, which
//!   covers terminal events the stream missed while disconnected.
//!
//! The first result obtained ends the wait; the loop returns on it, so a
//! result is never processed twice. Stream notifications about other
//! clients' jobs only trigger a queue-position refresh.
//!
//! At most one job is active per tracker. The guard is taken before the
//! submit request goes out, so overlapping calls are rejected rather than
//! queued.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApiError, Transport};
use crate::events::{progress_percent, StreamEvent};
use crate::queue::{QueuePosition, QueuePositionResolver};
use crate::result::JobResult;

/// Default interval between `/history` polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default overall deadline for [`JobClass::Light`] jobs.
const DEFAULT_LIGHT_JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Default overall deadline for [`JobClass::Heavy`] jobs.
const DEFAULT_HEAVY_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Size class of a job, selecting its overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobClass {
    /// Quick jobs such as text-to-image.
    Light,
    /// Long jobs such as image-to-mesh.
    Heavy,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    /// Per-call timeout for every transport request.
    pub request_timeout: Duration,
    pub light_job_timeout: Duration,
    pub heavy_job_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            light_job_timeout: DEFAULT_LIGHT_JOB_TIMEOUT,
            heavy_job_timeout: DEFAULT_HEAVY_JOB_TIMEOUT,
        }
    }
}

impl TrackerConfig {
    /// Overall deadline for a job of `class`.
    pub fn job_timeout(&self, class: JobClass) -> Duration {
        match class {
            JobClass::Light => self.light_job_timeout,
            JobClass::Heavy => self.heavy_job_timeout,
        }
    }
}

/// The job currently being tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    pub submitted_at: DateTime<Utc>,
}

/// Terminal outcome of [`JobTracker::submit_and_track`].
pub type JobOutcome = Result<JobResult, JobTrackerError>;

/// Errors that end a tracked job.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobTrackerError {
    /// Another job is still active on this tracker.
    #[error("A job is already being tracked")]
    AlreadyActive,

    /// The workflow could not be queued.
    #[error("Submission failed: {0}")]
    Submission(ComfyUIApiError),

    /// The server answered with something this client cannot interpret.
    #[error("Unexpected response from ComfyUI: {0}")]
    Protocol(String),

    /// Completion was not observed before the job deadline.
    #[error("Job did not finish within {0:?}")]
    JobTimeout(Duration),

    /// The server reported that execution failed.
    #[error("Execution failed at node {node_id}: {message}")]
    ExecutionFailed { node_id: String, message: String },

    /// The caller gave up on the job.
    #[error("Job tracking was abandoned")]
    Abandoned,
}

/// Callback surface for presentation layers.
///
/// Every method defaults to doing nothing, so implementors override only
/// what they display. Callbacks run on the tracking task and should
/// return quickly.
pub trait JobObserver: Send + Sync {
    /// Human-readable connection or retry status.
    fn on_status(&self, _text: &str) {}
    /// Server-wide queue depth changed.
    fn on_queue_depth(&self, _queue_remaining: u32) {}
    /// The tracked job's position in the queue was refreshed.
    fn on_queue_position(&self, _job_id: &str, _position: QueuePosition) {}
    fn on_job_started(&self, _job_id: &str) {}
    fn on_node_executing(&self, _node_id: &str, _job_id: &str) {}
    fn on_progress(&self, _value: u32, _max: u32) {}
    /// The job reached a terminal state. Not called for
    /// [`JobTrackerError::AlreadyActive`] rejections.
    fn on_job_terminal(&self, _outcome: &JobOutcome) {}
}

/// Observer that ignores every callback.
pub struct NoopObserver;

impl JobObserver for NoopObserver {}

struct ActiveJob {
    generation: u64,
    handle: Option<JobHandle>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    next_generation: u64,
    active: Option<ActiveJob>,
}

/// Per-job bookkeeping inside the wait loop.
struct WaitState {
    started: bool,
    position_stale: bool,
}

/// What one wake-up of the wait loop asks for.
enum Wake {
    Nothing,
    PollTick,
    /// The stream saw the job go idle.
    Idle,
}

/// Releases the active slot when a tracking call ends or is dropped.
struct SlotGuard<'a> {
    tracker: &'a JobTracker,
    generation: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.tracker.slot();
        if slot.active.as_ref().is_some_and(|a| a.generation == self.generation) {
            slot.active = None;
        }
    }
}

/// Tracks one job at a time against a server.
pub struct JobTracker {
    transport: Arc<dyn Transport>,
    resolver: QueuePositionResolver,
    client_id: String,
    events: tokio::sync::Mutex<mpsc::Receiver<StreamEvent>>,
    slot: Mutex<Slot>,
    observer: Arc<dyn JobObserver>,
    config: TrackerConfig,
}

impl JobTracker {
    /// * `events` - consumer half of an [`EventStream`](crate::stream::EventStream)
    ///   started with the same `client_id`.
    pub fn new(
        transport: Arc<dyn Transport>,
        client_id: String,
        events: mpsc::Receiver<StreamEvent>,
        observer: Arc<dyn JobObserver>,
        config: TrackerConfig,
    ) -> Self {
        let resolver = QueuePositionResolver::new(Arc::clone(&transport), config.request_timeout);
        Self {
            transport,
            resolver,
            client_id,
            events: tokio::sync::Mutex::new(events),
            slot: Mutex::new(Slot::default()),
            observer,
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// The job being tracked right now, if it has been accepted by the server.
    pub fn active_job(&self) -> Option<JobHandle> {
        self.slot().active.as_ref().and_then(|a| a.handle.clone())
    }

    /// Queue position of the active job, or `None` when no job is active.
    pub async fn queue_position(&self) -> Option<Result<QueuePosition, ComfyUIApiError>> {
        let job = self.active_job()?;
        Some(self.resolver.resolve(&job.job_id).await)
    }

    /// Submit `workflow` and wait for its terminal outcome.
    pub async fn submit_and_track(&self, workflow: &serde_json::Value, class: JobClass) -> JobOutcome {
        let (generation, cancel) = self.reserve()?;
        let _guard = SlotGuard {
            tracker: self,
            generation,
        };

        let job_timeout = self.config.job_timeout(class);
        let outcome = self.run_job(generation, &cancel, workflow, job_timeout).await;

        match &outcome {
            Ok(result) => tracing::info!(
                prompt_id = %result.job_id,
                outputs = result.outputs.len(),
                "Job completed",
            ),
            Err(e) => tracing::warn!(error = %e, "Job ended without a result"),
        }
        self.observer.on_job_terminal(&outcome);
        outcome
    }

    /// Stop tracking the active job without waiting for it.
    ///
    /// The server-side job is unaffected. Calling this with no active job
    /// does nothing.
    pub fn abandon(&self) {
        let Some(active) = self.slot().active.take() else {
            return;
        };
        active.cancel.cancel();
        tracing::info!(
            prompt_id = ?active.handle.map(|h| h.job_id),
            "Abandoned tracked job",
        );
    }

    // ---- private helpers ----

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self) -> Result<(u64, CancellationToken), JobTrackerError> {
        let mut slot = self.slot();
        if slot.active.is_some() {
            return Err(JobTrackerError::AlreadyActive);
        }
        let generation = slot.next_generation;
        slot.next_generation += 1;
        let cancel = CancellationToken::new();
        slot.active = Some(ActiveJob {
            generation,
            handle: None,
            cancel: cancel.clone(),
        });
        Ok((generation, cancel))
    }

    /// Record the accepted job, unless the reservation was abandoned meanwhile.
    fn record_handle(&self, generation: u64, handle: JobHandle) -> bool {
        let mut slot = self.slot();
        match slot.active.as_mut() {
            Some(active) if active.generation == generation => {
                active.handle = Some(handle);
                true
            }
            _ => false,
        }
    }

    async fn run_job(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        workflow: &serde_json::Value,
        job_timeout: Duration,
    ) -> JobOutcome {
        let mut events = tokio::select! {
            _ = cancel.cancelled() => return Err(JobTrackerError::Abandoned),
            events = self.events.lock() => events,
        };
        self.drain_stale(&mut events);

        let job_id = self
            .transport
            .submit(workflow, &self.client_id, self.config.request_timeout)
            .await
            .map_err(|e| match e {
                ComfyUIApiError::Protocol(msg) => JobTrackerError::Protocol(msg),
                other => JobTrackerError::Submission(other),
            })?;

        let handle = JobHandle {
            job_id: job_id.clone(),
            submitted_at: Utc::now(),
        };
        if !self.record_handle(generation, handle) {
            return Err(JobTrackerError::Abandoned);
        }
        tracing::info!(
            prompt_id = %job_id,
            timeout_secs = job_timeout.as_secs(),
            "Workflow submitted to ComfyUI",
        );
        self.observer
            .on_status(&format!("Started generation with prompt_id: {job_id}"));

        self.wait_for_completion(&job_id, cancel, &mut events, job_timeout)
            .await
    }

    /// Forward queue depth from notifications that predate this job and
    /// discard the rest.
    fn drain_stale(&self, events: &mut mpsc::Receiver<StreamEvent>) {
        while let Ok(event) = events.try_recv() {
            match event {
                StreamEvent::QueueDepth { queue_remaining } => {
                    self.observer.on_queue_depth(queue_remaining)
                }
                other => tracing::trace!(event = ?other, "Discarding stale notification"),
            }
        }
    }

    async fn wait_for_completion(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
        events: &mut mpsc::Receiver<StreamEvent>,
        job_timeout: Duration,
    ) -> JobOutcome {
        let deadline = Instant::now() + job_timeout;
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stream_open = true;
        let mut state = WaitState {
            started: false,
            position_stale: true,
        };

        loop {
            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(JobTrackerError::Abandoned),
                _ = &mut expired => return Err(JobTrackerError::JobTimeout(job_timeout)),
                event = events.recv(), if stream_open => match event {
                    Some(event) => self.observe(job_id, event, &mut state)?,
                    None => {
                        tracing::warn!(prompt_id = %job_id, "Event stream gone, relying on polling");
                        stream_open = false;
                        Wake::Nothing
                    }
                },
                _ = poll.tick() => Wake::PollTick,
            };

            match wake {
                Wake::Nothing => continue,
                Wake::PollTick => {
                    if !state.started && state.position_stale {
                        self.refresh_position(job_id, &mut state).await;
                    }
                }
                Wake::Idle => {
                    tracing::debug!(prompt_id = %job_id, "Stream reported completion, fetching result");
                }
            }

            if let Some(result) = self.poll_result(job_id, deadline).await? {
                return Ok(result);
            }
        }
    }

    /// Apply one notification. Only notifications for `job_id` can end
    /// the job; foreign ones at most mark the queue position stale.
    fn observe(
        &self,
        job_id: &str,
        event: StreamEvent,
        state: &mut WaitState,
    ) -> Result<Wake, JobTrackerError> {
        if let Some(other) = event.prompt_id().filter(|id| *id != job_id) {
            tracing::trace!(prompt_id = %other, "Notification for another job");
            if matches!(
                event,
                StreamEvent::ExecutionStarted { .. } | StreamEvent::ExecutionIdle { .. }
            ) {
                state.position_stale = true;
            }
            return Ok(Wake::Nothing);
        }

        match event {
            StreamEvent::Connected { .. } => {
                self.observer.on_status("Connected to ComfyUI event stream");
            }
            StreamEvent::ConnectionLost { reason, retry_in } => {
                self.observer.on_status(&format!(
                    "Event stream disconnected ({reason}); retrying in {}s",
                    retry_in.as_secs()
                ));
            }
            StreamEvent::QueueDepth { queue_remaining } => {
                self.observer.on_queue_depth(queue_remaining);
                state.position_stale = true;
            }
            StreamEvent::ExecutionStarted { .. } => {
                state.started = true;
                self.observer.on_job_started(job_id);
            }
            StreamEvent::NodeExecuting { node_id, .. } => {
                if !state.started {
                    state.started = true;
                    self.observer.on_job_started(job_id);
                }
                self.observer.on_node_executing(&node_id, job_id);
            }
            StreamEvent::Progress { value, max, .. } => {
                // Unattributed progress belongs to whatever runs now;
                // only report it once this job is the one running.
                if state.started {
                    tracing::debug!(prompt_id = %job_id, value, max, percent = progress_percent(value, max), "Generation progress");
                    self.observer.on_progress(value, max);
                }
            }
            StreamEvent::NodeOutput { node_id, .. } => {
                tracing::debug!(prompt_id = %job_id, node = %node_id, "Node executed with output");
            }
            StreamEvent::ExecutionIdle { .. } => return Ok(Wake::Idle),
            StreamEvent::ExecutionFailed {
                node_id,
                exception_type,
                message,
                ..
            } => {
                tracing::error!(
                    prompt_id = %job_id,
                    node_id = %node_id,
                    error_type = %exception_type,
                    error_message = %message,
                    "Execution error",
                );
                return Err(JobTrackerError::ExecutionFailed { node_id, message });
            }
        }
        Ok(Wake::Nothing)
    }

    /// Fetch the job's result once. Transient failures are reported and
    /// swallowed so the wait loop keeps going.
    async fn poll_result(
        &self,
        job_id: &str,
        deadline: Instant,
    ) -> Result<Option<JobResult>, JobTrackerError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        let timeout = self.config.request_timeout.min(remaining);

        match self.transport.fetch_result(job_id, timeout).await {
            Ok(Some(result)) if result.is_error() => {
                let (node_id, message) = result
                    .error_details()
                    .unwrap_or_else(|| (String::new(), "execution failed".to_string()));
                Err(JobTrackerError::ExecutionFailed { node_id, message })
            }
            Ok(result) => Ok(result),
            Err(e) if e.is_transient() => {
                tracing::warn!(prompt_id = %job_id, error = %e, "Polling for result failed, will retry");
                self.observer.on_status(&format!("[Connection Error] {e}"));
                Ok(None)
            }
            Err(e) => {
                tracing::error!(prompt_id = %job_id, error = %e, "Unusable result response");
                Err(JobTrackerError::Protocol(e.to_string()))
            }
        }
    }

    async fn refresh_position(&self, job_id: &str, state: &mut WaitState) {
        state.position_stale = false;
        match self.resolver.resolve(job_id).await {
            Ok(position) => self.observer.on_queue_position(job_id, position),
            Err(e) => {
                tracing::debug!(prompt_id = %job_id, error = %e, "Queue position unavailable");
                self.observer.on_status(&format!("Queue position unknown: {e}"));
            }
        }
    }
}
