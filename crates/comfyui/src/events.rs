//! Notifications emitted by the event stream.
//!
//! These represent state changes the job tracker cares about. They are
//! produced by the [`processor`](crate::processor) after interpreting
//! raw WebSocket messages, plus connection lifecycle notifications
//! produced by the [`stream`](crate::stream) run loop itself.
//!
//! Every job-scoped variant carries the `prompt_id` it describes. The
//! server broadcasts execution events for all clients, so consumers
//! must compare it against the job they track.

use std::time::Duration;

/// A typed notification pushed from the event stream to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The WebSocket subscription was established.
    Connected { client_id: String },

    /// The subscription failed or dropped; a retry follows after `retry_in`.
    ConnectionLost { reason: String, retry_in: Duration },

    /// Server-wide queue depth changed.
    QueueDepth { queue_remaining: u32 },

    /// A prompt began executing.
    ExecutionStarted { prompt_id: String },

    /// A node of a prompt is executing.
    NodeExecuting { node_id: String, prompt_id: String },

    /// The prompt has no further node to execute.
    ExecutionIdle { prompt_id: String },

    /// Step-level progress inside a node.
    Progress {
        value: u32,
        max: u32,
        /// Absent on servers that do not attribute progress to a prompt.
        prompt_id: Option<String>,
        node_id: Option<String>,
    },

    /// A node produced output.
    NodeOutput {
        node_id: String,
        prompt_id: String,
        output: serde_json::Value,
    },

    /// Execution of a prompt failed on the server.
    ExecutionFailed {
        prompt_id: String,
        node_id: String,
        exception_type: String,
        message: String,
    },
}

impl StreamEvent {
    /// The prompt this notification is about, if it is job-scoped.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::ExecutionStarted { prompt_id }
            | Self::NodeExecuting { prompt_id, .. }
            | Self::ExecutionIdle { prompt_id }
            | Self::NodeOutput { prompt_id, .. }
            | Self::ExecutionFailed { prompt_id, .. } => Some(prompt_id),
            Self::Progress { prompt_id, .. } => prompt_id.as_deref(),
            Self::Connected { .. } | Self::ConnectionLost { .. } | Self::QueueDepth { .. } => None,
        }
    }
}

/// Completion percentage (0-100) for a progress tick.
pub fn progress_percent(value: u32, max: u32) -> u8 {
    if max == 0 {
        return 0;
    }
    ((value.min(max) as f64 / max as f64) * 100.0) as u8
}
