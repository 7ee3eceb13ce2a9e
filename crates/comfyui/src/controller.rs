//! Generation controller for one ComfyUI server.
//!
//! [`ComfyUIController`] owns a client identity, the [`EventStream`]
//! subscribed under it and the [`JobTracker`] that consumes the stream's
//! notifications. Create it with [`ComfyUIController::start`] inside a
//! tokio runtime and end it with [`ComfyUIController::shutdown`].

use std::sync::Arc;
use std::time::Duration;

use crate::api::{ComfyUIApi, ComfyUIApiError, Transport};
use crate::client::WsConnector;
use crate::config::ComfyUIConfig;
use crate::queue::QueuePosition;
use crate::stream::{EventStream, EventStreamError, StreamState};
use crate::tracker::{JobClass, JobHandle, JobObserver, JobOutcome, JobTracker};

/// How long `shutdown` waits for the stream task to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ComfyUIController {
    client_id: String,
    api: Arc<ComfyUIApi>,
    stream: EventStream,
    tracker: JobTracker,
}

impl ComfyUIController {
    /// Generate a client identity, connect the event stream and get
    /// ready to track jobs.
    pub fn start(
        config: &ComfyUIConfig,
        observer: Arc<dyn JobObserver>,
    ) -> Result<Self, EventStreamError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let api = Arc::new(ComfyUIApi::new(config.api_url.clone()));
        let connector = Arc::new(WsConnector::new(config.ws_url.clone(), config.connect_timeout));

        let mut stream = EventStream::new(connector, client_id.clone(), config.stream_config());
        let events = stream.start()?;

        let transport: Arc<dyn Transport> = api.clone();
        let tracker = JobTracker::new(
            transport,
            client_id.clone(),
            events,
            observer,
            config.tracker_config(),
        );

        tracing::info!(
            client_id = %client_id,
            api_url = %config.api_url,
            ws_url = %config.ws_url,
            "ComfyUI controller started",
        );

        Ok(Self {
            client_id,
            api,
            stream,
            tracker,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// HTTP client, e.g. for downloading outputs of a finished job.
    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream.state()
    }

    pub async fn submit_and_track(&self, workflow: &serde_json::Value, class: JobClass) -> JobOutcome {
        self.tracker.submit_and_track(workflow, class).await
    }

    pub fn abandon(&self) {
        self.tracker.abandon();
    }

    pub fn active_job(&self) -> Option<JobHandle> {
        self.tracker.active_job()
    }

    pub async fn queue_position(&self) -> Option<Result<QueuePosition, ComfyUIApiError>> {
        self.tracker.queue_position().await
    }

    /// Abandon any active job and stop the event stream.
    ///
    /// Waits up to 5 seconds for the stream task to exit.
    pub async fn shutdown(mut self) {
        tracing::info!(client_id = %self.client_id, "Shutting down ComfyUI controller");
        self.tracker.abandon();
        self.stream.stop();

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.stream.join())
            .await
            .is_err()
        {
            tracing::warn!(client_id = %self.client_id, "Event stream did not stop in time");
        }

        tracing::info!("ComfyUI controller shut down complete");
    }
}
