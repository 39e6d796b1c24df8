//! REST client for the ComfyUI HTTP endpoints.
//!
//! [`HttpCaller`] wraps every outbound request in a bounded retry loop
//! and reports exhaustion as an empty value instead of an error, so the
//! caller decides what a missing response means. [`ComfyUIApi`] uses it
//! for prompt submission, history retrieval and artifact download.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::RetryPolicy;

/// Per-request timeout for a single attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from a single HTTP attempt.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// HTTP client with built-in retry.
pub struct HttpCaller {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpCaller {
    pub fn new(policy: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { client, policy }
    }

    /// POST a JSON body and decode a JSON response.
    pub async fn post_json(&self, url: &str, body: &serde_json::Value) -> Option<serde_json::Value> {
        self.with_retry(url, move || async move {
            let response = self.client.post(url).json(body).send().await?;
            let response = ensure_success(response).await?;
            Ok::<_, ApiError>(response.json::<serde_json::Value>().await?)
        })
        .await
    }

    /// GET and decode a JSON response.
    pub async fn get_json(&self, url: &str) -> Option<serde_json::Value> {
        self.with_retry(url, move || async move {
            let response = self.client.get(url).send().await?;
            let response = ensure_success(response).await?;
            Ok::<_, ApiError>(response.json::<serde_json::Value>().await?)
        })
        .await
    }

    /// GET raw bytes. Returns an empty vector when every attempt fails.
    pub async fn get_bytes(&self, url: &str, query: &[(&str, &str)]) -> Vec<u8> {
        self.with_retry(url, move || async move {
            let response = self.client.get(url).query(query).send().await?;
            let response = ensure_success(response).await?;
            Ok::<_, ApiError>(response.bytes().await?.to_vec())
        })
        .await
        .unwrap_or_default()
    }

    async fn with_retry<T, F, Fut>(&self, url: &str, op: F) -> Option<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let delays = self.policy.delays();

        for attempt in 1..=max_attempts {
            match op().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    tracing::warn!(url, attempt, max_attempts, error = %e, "HTTP call failed");
                    if let Some(delay) = delays.get(attempt as usize - 1) {
                        tokio::time::sleep(*delay).await;
                    }
                }
            }
        }

        tracing::error!(url, attempts = max_attempts, "HTTP call failed after all retries");
        None
    }
}

/// Ensure the response has a success status code.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Response returned by `POST /prompt` after queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: Option<i64>,
    /// Per-node validation errors, empty when the prompt was accepted.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

impl SubmitResponse {
    pub fn has_node_errors(&self) -> bool {
        match &self.node_errors {
            serde_json::Value::Object(map) => !map.is_empty(),
            serde_json::Value::Null => false,
            _ => true,
        }
    }
}

/// Reference to an output file listed in a history record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// REST endpoints of one ComfyUI instance.
pub struct ComfyUIApi {
    http: HttpCaller,
    base_url: String,
}

impl ComfyUIApi {
    /// * `endpoint` - backend address as `host:port`.
    pub fn new(endpoint: &str, policy: RetryPolicy) -> Self {
        Self {
            http: HttpCaller::new(policy),
            base_url: format!("http://{endpoint}"),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Submit a workflow with `POST /prompt`.
    ///
    /// `None` means the call failed after retries or the response had no
    /// `prompt_id`.
    pub async fn queue_prompt(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Option<SubmitResponse> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let value = self
            .http
            .post_json(&format!("{}/prompt", self.base_url), &body)
            .await?;

        match serde_json::from_value::<SubmitResponse>(value) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::error!(error = %e, "Unexpected /prompt response");
                None
            }
        }
    }

    /// Retrieve the history record for a prompt with `GET /history/{prompt_id}`.
    pub async fn get_history(&self, prompt_id: &str) -> Option<serde_json::Value> {
        self.http
            .get_json(&format!("{}/history/{}", self.base_url, prompt_id))
            .await
    }

    /// Download one output file with `GET /view`. Empty on failure.
    pub async fn get_artifact(&self, artifact: &ArtifactRef) -> Vec<u8> {
        self.http
            .get_bytes(
                &format!("{}/view", self.base_url),
                &[
                    ("filename", artifact.filename.as_str()),
                    ("subfolder", artifact.subfolder.as_str()),
                    ("type", artifact.folder_type.as_str()),
                ],
            )
            .await
    }
}
