//! ComfyUI job submission and monitoring.
//!
//! Submits generation workflows to a ComfyUI server and follows each job
//! to a terminal outcome through two channels at once: the server's
//! WebSocket event feed and direct `/history` polling.
//!
//! - [`api`] - HTTP transport (submit, history, queue, output download).
//! - [`stream`] - persistent event-stream monitor with fixed-delay reconnect.
//! - [`tracker`] - single-job lifecycle and the observer callback surface.
//! - [`queue`] - queue snapshots and position resolution.
//! - [`controller`] - wires the above together for one client identity.

pub mod api;
pub mod client;
pub mod config;
pub mod controller;
pub mod events;
pub mod messages;
pub mod processor;
pub mod queue;
pub mod result;
pub mod stream;
pub mod tracker;

pub use api::{ComfyUIApi, ComfyUIApiError, Transport};
pub use config::{ComfyUIConfig, ConfigError};
pub use controller::ComfyUIController;
pub use events::StreamEvent;
pub use queue::{QueuePosition, QueuePositionResolver, QueueSnapshot};
pub use result::{JobResult, OutputImage};
pub use stream::{EventStream, StreamConfig, StreamState};
pub use tracker::{JobClass, JobHandle, JobObserver, JobOutcome, JobTracker, JobTrackerError, TrackerConfig};
