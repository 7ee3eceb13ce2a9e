//! Persistent event-stream monitor.
//!
//! [`EventStream`] keeps one subscription to the server's event feed
//! open for a client identity. It runs as its own task:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> ...
//!        \____________\______________\__________> Stopped
//! ```
//!
//! Any connect failure or dropped connection emits a
//! [`StreamEvent::ConnectionLost`], waits a fixed delay and reconnects.
//! It never gives up on its own; only [`EventStream::stop`] ends it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::StreamConnector;
use crate::events::StreamEvent;
use crate::processor::{process_frames, EventSink, SessionEnd};

/// Notification queue capacity.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default delay between reconnection attempts.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection lifecycle of an [`EventStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// Tunables for the run loop.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Fixed wait between a failure and the next connection attempt.
    pub reconnect_delay: Duration,
    /// Capacity of the notification queue.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            channel_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventStreamError {
    /// `start` may only be called once per instance.
    #[error("Event stream was already started or stopped")]
    AlreadyStarted,
}

/// Owned handle to the event-stream task.
pub struct EventStream {
    connector: Arc<dyn StreamConnector>,
    client_id: String,
    config: StreamConfig,
    cancel: CancellationToken,
    /// Moved into the task on `start`.
    state_tx: Option<watch::Sender<StreamState>>,
    state_rx: watch::Receiver<StreamState>,
    task: Option<JoinHandle<()>>,
}

impl EventStream {
    pub fn new(connector: Arc<dyn StreamConnector>, client_id: String, config: StreamConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(StreamState::Disconnected);
        Self {
            connector,
            client_id,
            config,
            cancel: CancellationToken::new(),
            state_tx: Some(state_tx),
            state_rx,
            task: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state_rx.clone()
    }

    /// Spawn the run loop and return the consumer half of the
    /// notification queue.
    pub fn start(&mut self) -> Result<mpsc::Receiver<StreamEvent>, EventStreamError> {
        let state_tx = self.state_tx.take().ok_or(EventStreamError::AlreadyStarted)?;
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);

        let connector = Arc::clone(&self.connector);
        let client_id = self.client_id.clone();
        let delay = self.config.reconnect_delay;
        let cancel = self.cancel.clone();
        let sink = EventSink::new(tx);

        self.task = Some(tokio::spawn(async move {
            tracing::info!(client_id = %client_id, "Starting event stream");
            run_stream_loop(connector.as_ref(), &client_id, delay, &sink, &state_tx, &cancel).await;
            state_tx.send_replace(StreamState::Stopped);
            tracing::info!(client_id = %client_id, "Event stream stopped");
        }));

        Ok(rx)
    }

    /// Ask the run loop to exit at its next suspension point.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        // Never started: nothing will publish the final state.
        if let Some(state_tx) = self.state_tx.take() {
            state_tx.send_replace(StreamState::Stopped);
        }
    }

    /// Wait for the run loop to finish. Returns immediately if it was
    /// never started.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Event stream task failed");
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connect -> forward notifications -> wait -> reconnect, until cancelled.
async fn run_stream_loop(
    connector: &dyn StreamConnector,
    client_id: &str,
    delay: Duration,
    sink: &EventSink,
    state: &watch::Sender<StreamState>,
    cancel: &CancellationToken,
) {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        state.send_replace(StreamState::Connecting);
        tracing::debug!(client_id = %client_id, attempt, "Connecting to event stream");

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connector.connect(client_id) => result,
        };

        let reason = match connected {
            Ok(mut frames) => {
                attempt = 0;
                state.send_replace(StreamState::Connected);
                sink.push(StreamEvent::Connected {
                    client_id: client_id.to_string(),
                });

                match process_frames(&mut frames, sink, cancel).await {
                    SessionEnd::Cancelled => return,
                    SessionEnd::Closed => "connection closed by server".to_string(),
                    SessionEnd::Failed(e) => e,
                }
            }
            Err(e) => {
                tracing::warn!(
                    client_id = %client_id,
                    error = %e,
                    "Event stream connect attempt {attempt} failed",
                );
                e.to_string()
            }
        };

        state.send_replace(StreamState::Disconnected);
        tracing::info!(
            client_id = %client_id,
            reason = %reason,
            delay_ms = delay.as_millis() as u64,
            "Event stream disconnected, reconnecting",
        );
        sink.push(StreamEvent::ConnectionLost {
            reason,
            retry_in: delay,
        });

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ComfyUIClientError, FrameStream};
    use async_trait::async_trait;

    struct RefusingConnector;

    #[async_trait]
    impl StreamConnector for RefusingConnector {
        async fn connect(&self, _client_id: &str) -> Result<FrameStream, ComfyUIClientError> {
            Err(ComfyUIClientError::Connection("refused".into()))
        }
    }

    fn stream() -> EventStream {
        EventStream::new(Arc::new(RefusingConnector), "c".into(), StreamConfig::default())
    }

    #[test]
    fn default_delay_is_five_seconds() {
        assert_eq!(StreamConfig::default().reconnect_delay, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let mut stream = stream();
        let _rx = stream.start().unwrap();
        assert!(matches!(stream.start(), Err(EventStreamError::AlreadyStarted)));
        stream.stop();
        stream.join().await;
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn stop_before_start_is_terminal() {
        let mut stream = stream();
        assert_eq!(stream.state(), StreamState::Disconnected);
        stream.stop();
        assert_eq!(stream.state(), StreamState::Stopped);
        assert!(stream.start().is_err());
        stream.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_reports_connection_lost() {
        let mut stream = stream();
        let mut rx = stream.start().unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            StreamEvent::ConnectionLost {
                reason: "Connection error: refused".into(),
                retry_in: Duration::from_secs(5),
            }
        );

        stream.stop();
        stream.join().await;
    }
}
