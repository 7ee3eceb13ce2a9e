use std::time::Duration;

use crate::stream::StreamConfig;
use crate::tracker::TrackerConfig;

/// ComfyUI connection settings loaded from environment variables.
///
/// All fields have defaults suitable for a server on the local machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComfyUIConfig {
    /// HTTP base URL (default: `http://localhost:8188`).
    pub api_url: String,
    /// WebSocket base URL (default: `api_url` with a `ws`/`wss` scheme).
    pub ws_url: String,
    /// Per-request timeout (default: 30s).
    pub request_timeout: Duration,
    /// WebSocket handshake timeout (default: 10s).
    pub connect_timeout: Duration,
    /// Fixed delay between stream reconnect attempts (default: 5s).
    pub reconnect_delay: Duration,
    /// Interval between result polls (default: 1000ms).
    pub poll_interval: Duration,
    /// Deadline for light jobs (default: 60s).
    pub light_job_timeout: Duration,
    /// Deadline for heavy jobs (default: 300s).
    pub heavy_job_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

impl ComfyUIConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default                 |
    /// |----------------------------------|-------------------------|
    /// | `COMFYUI_API_URL`                | `http://localhost:8188` |
    /// | `COMFYUI_WS_URL`                 | derived from API URL    |
    /// | `COMFYUI_REQUEST_TIMEOUT_SECS`   | `30`                    |
    /// | `COMFYUI_CONNECT_TIMEOUT_SECS`   | `10`                    |
    /// | `COMFYUI_RECONNECT_DELAY_SECS`   | `5`                     |
    /// | `COMFYUI_POLL_INTERVAL_MS`       | `1000`                  |
    /// | `COMFYUI_LIGHT_JOB_TIMEOUT_SECS` | `60`                    |
    /// | `COMFYUI_HEAVY_JOB_TIMEOUT_SECS` | `300`                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("COMFYUI_API_URL")
            .unwrap_or_else(|| "http://localhost:8188".into())
            .trim_end_matches('/')
            .to_string();

        let ws_url = match lookup("COMFYUI_WS_URL") {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => derive_ws_url(&api_url),
        };

        let secs = |var: &'static str, default: u64| -> Result<Duration, ConfigError> {
            parse_u64(&lookup, var, default).map(Duration::from_secs)
        };

        Ok(Self {
            request_timeout: secs("COMFYUI_REQUEST_TIMEOUT_SECS", 30)?,
            connect_timeout: secs("COMFYUI_CONNECT_TIMEOUT_SECS", 10)?,
            reconnect_delay: secs("COMFYUI_RECONNECT_DELAY_SECS", 5)?,
            poll_interval: Duration::from_millis(parse_u64(&lookup, "COMFYUI_POLL_INTERVAL_MS", 1000)?),
            light_job_timeout: secs("COMFYUI_LIGHT_JOB_TIMEOUT_SECS", 60)?,
            heavy_job_timeout: secs("COMFYUI_HEAVY_JOB_TIMEOUT_SECS", 300)?,
            api_url,
            ws_url,
        })
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            poll_interval: self.poll_interval,
            request_timeout: self.request_timeout,
            light_job_timeout: self.light_job_timeout,
            heavy_job_timeout: self.heavy_job_timeout,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            reconnect_delay: self.reconnect_delay,
            ..StreamConfig::default()
        }
    }
}

fn parse_u64<F>(lookup: &F, var: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ConfigError::Invalid { var, value }),
        },
    }
}

/// `http://host` -> `ws://host`, `https://host` -> `wss://host`.
fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{api_url}")
    }
}
