//! Queue snapshots and the tracked job's position in them.
//!
//! ComfyUI's `GET /queue` answers
//! `{"queue_running": [[number, prompt_id, prompt, extra_data, outputs], ...],
//!   "queue_pending": [...]}` describing every client's prompts. Only the
//! prompt id (index 1) is required here.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::api::{ComfyUIApiError, Transport};

/// One queued or running prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: String,
    /// The submitting client, when the server reports it.
    pub client_id: Option<String>,
    /// Server-side queue number, used to order pending entries.
    pub number: Option<i64>,
}

/// Point-in-time view of the server's execution queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub running: Vec<QueueEntry>,
    pub pending: Vec<QueueEntry>,
}

/// Where a job sits in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    /// The job is running right now (position 0).
    Executing,
    /// 1-based wait position among pending jobs.
    Waiting(usize),
    /// Not in the queue: just finished, or not registered yet.
    NotFound,
}

impl QueuePosition {
    /// Numeric position with `0` for a running job.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Executing => Some(0),
            Self::Waiting(n) => Some(*n),
            Self::NotFound => None,
        }
    }
}

impl fmt::Display for QueuePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executing => write!(f, "executing"),
            Self::Waiting(n) => write!(f, "position {n} in queue"),
            Self::NotFound => write!(f, "not in queue"),
        }
    }
}

impl QueueSnapshot {
    /// Decode a `/queue` response body.
    ///
    /// Missing lists are treated as empty. Entries that are not arrays
    /// with a string prompt id at index 1 are skipped.
    pub fn from_value(body: &serde_json::Value) -> Result<Self, String> {
        if !body.is_object() {
            return Err(format!("queue body is not an object: {body}"));
        }

        let running = parse_entries(body.get("queue_running"));
        let mut pending = parse_entries(body.get("queue_pending"));

        // The server reports pending prompts in heap order.
        if pending.iter().all(|e| e.number.is_some()) {
            pending.sort_by_key(|e| e.number);
        }

        Ok(Self { running, pending })
    }

    /// Position of `job_id`. A running entry wins over a pending one.
    pub fn position_of(&self, job_id: &str) -> QueuePosition {
        if self.running.iter().any(|e| e.job_id == job_id) {
            return QueuePosition::Executing;
        }
        match self.pending.iter().position(|e| e.job_id == job_id) {
            Some(i) => QueuePosition::Waiting(i + 1),
            None => QueuePosition::NotFound,
        }
    }

    /// Running plus pending entries.
    pub fn len(&self) -> usize {
        self.running.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_entries(list: Option<&serde_json::Value>) -> Vec<QueueEntry> {
    let Some(items) = list.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let fields = item.as_array()?;
            let job_id = fields.get(1)?.as_str()?.to_string();
            let head = fields.first();
            let client_id = fields
                .get(3)
                .and_then(|extra| extra.get("client_id"))
                .and_then(|v| v.as_str())
                .or_else(|| head.and_then(|v| v.as_str()))
                .map(String::from);
            Some(QueueEntry {
                job_id,
                client_id,
                number: head.and_then(|v| v.as_i64()),
            })
        })
        .collect()
}

/// Computes a job's queue position from a fresh snapshot.
pub struct QueuePositionResolver {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl QueuePositionResolver {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Fetch the queue and locate `job_id` in it.
    ///
    /// An error only means the position is unknown; it says nothing
    /// about the job itself.
    pub async fn resolve(&self, job_id: &str) -> Result<QueuePosition, ComfyUIApiError> {
        let snapshot = self.transport.fetch_queue_snapshot(self.timeout).await?;
        let position = snapshot.position_of(job_id);
        tracing::debug!(
            prompt_id = %job_id,
            running = snapshot.running.len(),
            pending = snapshot.pending.len(),
            %position,
            "Resolved queue position",
        );
        Ok(position)
    }
}
