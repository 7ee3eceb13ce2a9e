//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, queue snapshot,
//! history retrieval, output download) using [`reqwest`]. The
//! [`Transport`] trait is the seam the job tracker and queue resolver
//! depend on; [`ComfyUIApi`] is its HTTP implementation.
//!
//! Every call takes its own timeout. Exceeding it yields
//! [`ComfyUIApiError::Timeout`], which callers keep apart from
//! [`ComfyUIApiError::Connectivity`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::queue::QueueSnapshot;
use crate::result::{JobResult, OutputImage};

/// Request/response operations the job tracker needs from a server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a workflow and return the server-assigned prompt id.
    async fn submit(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
        timeout: Duration,
    ) -> Result<String, ComfyUIApiError>;

    /// Fetch the finished result of a prompt, or `None` while the
    /// server has no history entry for it yet.
    async fn fetch_result(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<Option<JobResult>, ComfyUIApiError>;

    /// Fetch the current running/pending queue of every client.
    async fn fetch_queue_snapshot(&self, timeout: Duration)
        -> Result<QueueSnapshot, ComfyUIApiError>;
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The server could not be reached (network, DNS, TLS, 5xx).
    #[error("ComfyUI unreachable: {0}")]
    Connectivity(String),

    /// The call did not complete within its timeout.
    #[error("ComfyUI request timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with something this client cannot interpret.
    #[error("Unexpected response from ComfyUI: {0}")]
    Protocol(String),

    /// The server refused to queue the workflow.
    #[error("ComfyUI rejected the workflow ({status}): {body}")]
    Submission {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl ComfyUIApiError {
    /// Whether the failure may clear up by itself and the call is
    /// worth repeating.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Timeout(_))
    }

    fn from_request(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Connectivity(err.to_string())
        }
    }

    /// Classify a non-success status on a read-only endpoint.
    fn from_status(status: StatusCode, body: &str) -> Self {
        if status.is_server_error() {
            Self::Connectivity(format!("server returned {status}"))
        } else {
            Self::Protocol(format!("status {status}: {body}"))
        }
    }
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: Option<i64>,
}

/// Extract the prompt id from a `/prompt` response body.
///
/// A missing or empty `prompt_id` is a protocol error: the job cannot be
/// tracked without it.
pub fn parse_submit_response(body: &str) -> Result<String, ComfyUIApiError> {
    let response: SubmitResponse = serde_json::from_str(body)
        .map_err(|e| ComfyUIApiError::Protocol(format!("malformed submit response: {e}")))?;

    match response.prompt_id {
        Some(id) if !id.trim().is_empty() => Ok(id),
        _ => Err(ComfyUIApiError::Protocol(
            "submit response carried no prompt_id".to_string(),
        )),
    }
}

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// HTTP API base URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Download a file produced by a finished prompt.
    ///
    /// Sends `GET /view?filename=..&subfolder=..&type=..`.
    pub async fn fetch_output(
        &self,
        image: &OutputImage,
        timeout: Duration,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ]);

        let response = Self::send(request, timeout).await?;
        let status = response.status();
        if !status.is_success() {
            let body = Self::body_text(response).await;
            return Err(ComfyUIApiError::from_status(status, &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ComfyUIApiError::from_request(e, timeout))?;
        Ok(bytes.to_vec())
    }

    // ---- private helpers ----

    async fn send(
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ComfyUIApiError::from_request(e, timeout))
    }

    /// Read the body of an error response for diagnostics.
    async fn body_text(response: reqwest::Response) -> String {
        response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string())
    }

    /// Read a success response body as JSON, mapping an empty body to `None`.
    async fn read_json(
        response: reqwest::Response,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, ComfyUIApiError> {
        let text = response
            .text()
            .await
            .map_err(|e| ComfyUIApiError::from_request(e, timeout))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| ComfyUIApiError::Protocol(format!("invalid JSON body: {e}")))
    }
}

#[async_trait]
impl Transport for ComfyUIApi {
    /// Sends `POST /prompt` with the workflow and client id.
    async fn submit(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
        timeout: Duration,
    ) -> Result<String, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let request = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body);
        let response = Self::send(request, timeout).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ComfyUIApiError::Submission {
                status: status.as_u16(),
                body: Self::body_text(response).await,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ComfyUIApiError::from_request(e, timeout))?;
        parse_submit_response(&text)
    }

    /// Sends `GET /history/{job_id}`.
    async fn fetch_result(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<Option<JobResult>, ComfyUIApiError> {
        let request = self
            .client
            .get(format!("{}/history/{}", self.api_url, job_id));
        let response = Self::send(request, timeout).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = Self::body_text(response).await;
            return Err(ComfyUIApiError::from_status(status, &body));
        }

        match Self::read_json(response, timeout).await? {
            Some(body) => JobResult::from_history(job_id, body).map_err(ComfyUIApiError::Protocol),
            None => Ok(None),
        }
    }

    /// Sends `GET /queue`.
    async fn fetch_queue_snapshot(
        &self,
        timeout: Duration,
    ) -> Result<QueueSnapshot, ComfyUIApiError> {
        let request = self.client.get(format!("{}/queue", self.api_url));
        let response = Self::send(request, timeout).await?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::body_text(response).await;
            return Err(ComfyUIApiError::from_status(status, &body));
        }

        match Self::read_json(response, timeout).await? {
            Some(body) => QueueSnapshot::from_value(&body).map_err(ComfyUIApiError::Protocol),
            None => Err(ComfyUIApiError::Protocol("empty queue response".to_string())),
        }
    }
}
