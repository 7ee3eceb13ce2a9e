//! WebSocket frame processing.
//!
//! Reads text frames from a ComfyUI subscription, parses them into typed
//! [`ServerMessage`] variants and pushes the resulting
//! [`StreamEvent`]s into the notification queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::FrameStream;
use crate::events::StreamEvent;
use crate::messages::{parse_message, ServerMessage};

/// Producer half of the notification queue.
///
/// Pushing never blocks the stream: when the consumer falls behind the
/// notification is dropped and the tracker's polling covers the gap.
/// Between jobs nobody drains the queue, so a full queue is logged once
/// per episode rather than once per dropped notification.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    /// Notifications dropped since the queue last accepted one.
    dropped: Arc<AtomicUsize>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&self, event: StreamEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                let dropped = self.dropped.swap(0, Ordering::Relaxed);
                if dropped > 0 {
                    tracing::debug!(dropped, "Notification queue accepting events again");
                }
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    tracing::warn!(?event, "Notification queue full, dropping events until it drains");
                } else {
                    tracing::trace!(?event, "Dropping notification");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("Notification consumer gone");
            }
        }
    }
}

/// Why a subscription session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server closed the connection.
    Closed,
    /// Receiving failed.
    Failed(String),
    /// `stop()` was requested.
    Cancelled,
}

/// Forward notifications from one live subscription until it ends.
pub async fn process_frames(
    frames: &mut FrameStream,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> SessionEnd {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(text)) => {
                if let Some(event) = decode_frame(&text) {
                    sink.push(event);
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "WebSocket receive error");
                return SessionEnd::Failed(e.to_string());
            }
            None => return SessionEnd::Closed,
        }
    }
}

/// Turn one text frame into a notification, or `None` when the frame is
/// unknown, malformed or carries nothing the tracker uses.
pub fn decode_frame(text: &str) -> Option<StreamEvent> {
    match parse_message(text) {
        Ok(msg) => translate(msg),
        Err(e) => {
            tracing::debug!(error = %e, raw_message = %text, "Dropping unrecognised ComfyUI message");
            None
        }
    }
}

fn translate(msg: ServerMessage) -> Option<StreamEvent> {
    let event = match msg {
        ServerMessage::Status { status } => StreamEvent::QueueDepth {
            queue_remaining: status.exec_info.queue_remaining,
        },
        ServerMessage::ExecutionStart { prompt_id } => StreamEvent::ExecutionStarted { prompt_id },
        ServerMessage::ExecutionCached { prompt_id, nodes } => {
            tracing::debug!(prompt_id = %prompt_id, cached = nodes.len(), "Execution used cache");
            return None;
        }
        ServerMessage::Executing {
            node: Some(node_id),
            prompt_id,
        } => StreamEvent::NodeExecuting { node_id, prompt_id },
        ServerMessage::Executing { node: None, prompt_id } => StreamEvent::ExecutionIdle { prompt_id },
        ServerMessage::Progress {
            value,
            max,
            prompt_id,
            node,
        } => StreamEvent::Progress {
            value,
            max,
            prompt_id,
            node_id: node,
        },
        ServerMessage::Executed {
            node,
            prompt_id,
            output,
        } => StreamEvent::NodeOutput {
            node_id: node,
            prompt_id,
            output,
        },
        ServerMessage::ExecutionError {
            prompt_id,
            node_id,
            exception_type,
            exception_message,
        } => StreamEvent::ExecutionFailed {
            prompt_id,
            node_id,
            exception_type,
            message: exception_message,
        },
        ServerMessage::ExecutionInterrupted { prompt_id, node_id } => StreamEvent::ExecutionFailed {
            prompt_id,
            node_id: node_id.unwrap_or_default(),
            exception_type: "Interrupted".to_string(),
            message: "execution was interrupted on the server".to_string(),
        },
    };
    Some(event)
}
