//! Task API
//!
//! HTTP endpoints that create and drive tasks. A task is created with
//! `init` (not yet running), the caller joins its room, and only then calls
//! `start`, so no early event is missed.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tasks::{TaskId, TaskStatus};

/// Path prefix of the task endpoints
const API_PREFIX: &str = "/api/agent";

/// Request timeout for API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the task API
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request did not complete
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a failure
    #[error("Task API rejected the request ({status}): {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Server-provided reason
        message: String,
    },
    /// The response did not have the expected shape
    #[error("Malformed task API response: {0}")]
    Malformed(String),
}

/// Answer to `init`, `start` and `cancel`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TaskAck {
    /// Task the call was about
    pub task_id: TaskId,
    /// Server-side status after the call
    pub status: String,
    /// Human-readable note
    #[serde(default)]
    pub message: Option<String>,
}

impl TaskAck {
    /// Server status mapped onto the local lifecycle
    #[must_use]
    pub fn task_status(&self) -> TaskStatus {
        TaskStatus::parse(&self.status)
    }
}

/// Answer to `status`
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TaskStatusReport {
    /// Task id
    pub task_id: TaskId,
    /// Server-side status (`pending`, `running`, `completed`, `failed`, `cancelled`)
    pub status: String,
    /// Progress percentage
    #[serde(default)]
    pub progress: f64,
    /// Step the agent is on
    #[serde(default)]
    pub current_step: Option<String>,
    /// Creation time as reported
    #[serde(default)]
    pub created_at: Option<String>,
    /// Start time as reported
    #[serde(default)]
    pub started_at: Option<String>,
    /// Completion time as reported
    #[serde(default)]
    pub completed_at: Option<String>,
    /// Failure text
    #[serde(default)]
    pub error: Option<String>,
    /// Final result, present once completed
    #[serde(default)]
    pub result: Option<Value>,
}

impl TaskStatusReport {
    /// Server status mapped onto the local lifecycle
    #[must_use]
    pub fn task_status(&self) -> TaskStatus {
        TaskStatus::parse(&self.status)
    }
}

#[derive(Serialize)]
struct InitRequest<'a> {
    topic: &'a str,
    images: &'a [String],
}

/// Client for the task endpoints
#[derive(Clone, Debug)]
pub struct TaskApi {
    base_url: String,
    http_client: reqwest::Client,
}

impl TaskApi {
    /// Create a client for the server at `base_url`
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Http` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(base_url, http_client))
    }

    /// Use an already configured HTTP client
    #[must_use]
    pub fn with_client(base_url: impl Into<String>, http_client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        }
    }

    /// Server address in use
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{API_PREFIX}/{path}", self.base_url)
    }

    /// Create a task without starting it
    ///
    /// # Errors
    ///
    /// Returns `ApiError` if the request fails or the server refuses.
    pub async fn init(&self, topic: &str, images: &[String]) -> Result<TaskAck, ApiError> {
        let request = self
            .http_client
            .post(self.endpoint("init"))
            .json(&InitRequest { topic, images });
        let ack: TaskAck = send(request).await?;
        tracing::info!(task_id = %ack.task_id, "Task created");
        Ok(ack)
    }

    /// Start a created task
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Rejected` when the task does not exist (404) or is
    /// no longer pending (400).
    pub async fn start(&self, task_id: &TaskId) -> Result<TaskAck, ApiError> {
        let request = self
            .http_client
            .post(self.endpoint(&format!("start/{task_id}")));
        let ack: TaskAck = send(request).await?;
        tracing::info!(task_id = %task_id, "Task started");
        Ok(ack)
    }

    /// Cancel a task
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Rejected` when the task does not exist or has
    /// already finished.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<TaskAck, ApiError> {
        let request = self
            .http_client
            .post(self.endpoint(&format!("cancel/{task_id}")));
        let ack: TaskAck = send(request).await?;
        tracing::info!(task_id = %task_id, "Task cancelled");
        Ok(ack)
    }

    /// Fetch a task's server-side status
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Rejected` when the task does not exist.
    pub async fn status(&self, task_id: &TaskId) -> Result<TaskStatusReport, ApiError> {
        let request = self
            .http_client
            .get(self.endpoint(&format!("status/{task_id}")));
        send(request).await
    }
}

async fn send<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, ApiError> {
    let response = request.send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    decode_response(status, &body)
}

/// Interpret a `{success, ...}` envelope
fn decode_response<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, ApiError> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) if (200..300).contains(&status) => return Err(ApiError::Malformed(e.to_string())),
        Err(_) => {
            return Err(ApiError::Rejected {
                status,
                message: body.trim().to_string(),
            })
        }
    };

    let success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
    if !success || !(200..300).contains(&status) {
        let message = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        tracing::warn!(status, error = %message, "Task API refused");
        return Err(ApiError::Rejected { status, message });
    }

    serde_json::from_value(value).map_err(|e| ApiError::Malformed(e.to_string()))
}
