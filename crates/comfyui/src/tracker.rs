//! Execution tracking for submitted prompts.
//!
//! [`ExecutionTracker::run`] submits a workflow over REST, follows the
//! websocket event stream until ComfyUI reports the prompt finished,
//! then pulls the history record and downloads every output file.
//! Dropped connections and missing responses trigger a reconnect and a
//! full resubmission, up to `submit_attempts` times.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::api::{ArtifactRef, ComfyUIApi};
use crate::backoff::RetryPolicy;
use crate::messages::{parse_message, ComfyUIMessage};
use crate::session::{BackendSession, Frame, Received, SessionError};

/// Default consecutive receive failures tolerated while tracking.
pub const MAX_RECEIVE_ERRORS: u32 = 5;

/// Default submit-and-track attempts per job.
pub const SUBMIT_ATTEMPTS: u32 = 3;

/// Budgets for one tracked job.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Consecutive `receive()` failures before tracking is abandoned,
    /// and the pause after each one.
    pub receive_errors: RetryPolicy,
    /// Full submission attempts, including the first.
    pub submit_attempts: u32,
    /// Pause before a resubmission.
    pub resubmit_delay: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            receive_errors: RetryPolicy::fixed(MAX_RECEIVE_ERRORS, Duration::from_secs(1)),
            submit_attempts: SUBMIT_ATTEMPTS,
            resubmit_delay: Duration::from_secs(1),
        }
    }
}

/// Outcome of applying one event to a [`SubmittedExecution`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackStep {
    Continue,
    Completed,
    Failed(String),
}

/// Bookkeeping for the prompt currently executing on the backend.
#[derive(Debug, Clone)]
pub struct SubmittedExecution {
    prompt_id: String,
    node_ids: BTreeSet<String>,
    finished_nodes: BTreeSet<String>,
}

impl SubmittedExecution {
    /// Node ids are the top-level keys of the submitted workflow.
    pub fn new(prompt_id: impl Into<String>, workflow: &serde_json::Value) -> Self {
        let node_ids = workflow
            .as_object()
            .map(|nodes| nodes.keys().cloned().collect())
            .unwrap_or_default();

        Self {
            prompt_id: prompt_id.into(),
            node_ids,
            finished_nodes: BTreeSet::new(),
        }
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub fn node_ids(&self) -> &BTreeSet<String> {
        &self.node_ids
    }

    pub fn finished_nodes(&self) -> &BTreeSet<String> {
        &self.finished_nodes
    }

    /// Record a node as finished. Returns `false` if it already was.
    pub fn mark_finished(&mut self, node: &str) -> bool {
        let added = self.finished_nodes.insert(node.to_string());
        if added {
            tracing::info!(
                prompt_id = %self.prompt_id,
                "Progress: {} / {} nodes done",
                self.finished_nodes.len(),
                self.node_ids.len(),
            );
        }
        added
    }

    /// Events tagged with another prompt never touch this execution.
    fn concerns(&self, prompt_id: Option<&str>) -> bool {
        prompt_id.map_or(true, |id| id == self.prompt_id)
    }

    /// Apply one decoded websocket event.
    pub fn apply(&mut self, msg: &ComfyUIMessage) -> TrackStep {
        match msg {
            ComfyUIMessage::Progress(data) => {
                tracing::info!(
                    prompt_id = %self.prompt_id,
                    "In K-Sampler -> Step: {} of: {}",
                    data.value,
                    data.max,
                );
                TrackStep::Continue
            }
            ComfyUIMessage::ExecutionCached(data) => {
                if self.concerns(data.prompt_id.as_deref()) {
                    for node in &data.nodes {
                        self.mark_finished(node);
                    }
                }
                TrackStep::Continue
            }
            ComfyUIMessage::Executing(data) => {
                if !self.concerns(data.prompt_id.as_deref()) {
                    return TrackStep::Continue;
                }
                match &data.node {
                    Some(node) => {
                        self.mark_finished(node);
                        TrackStep::Continue
                    }
                    None if data.prompt_id.as_deref() == Some(self.prompt_id.as_str()) => {
                        TrackStep::Completed
                    }
                    None => TrackStep::Continue,
                }
            }
            ComfyUIMessage::ExecutionError(data) if data.prompt_id == self.prompt_id => {
                TrackStep::Failed(format!(
                    "{} in node {}: {}",
                    data.exception_type,
                    data.node_id.as_deref().unwrap_or("?"),
                    data.exception_message,
                ))
            }
            other => {
                tracing::debug!(prompt_id = %self.prompt_id, event = ?other, "Ignoring event");
                TrackStep::Continue
            }
        }
    }

    /// Decode and apply one raw frame. Malformed text frames are skipped.
    pub fn apply_frame(&mut self, frame: &Frame) -> TrackStep {
        match frame {
            Frame::Text(text) => match parse_message(text) {
                Ok(msg) => self.apply(&msg),
                Err(e) => {
                    tracing::warn!(error = %e, raw_message = %text, "Skipping malformed event");
                    TrackStep::Continue
                }
            },
            Frame::Binary(_) => {
                tracing::trace!("Ignoring binary frame (preview image)");
                TrackStep::Continue
            }
        }
    }
}

/// Outputs of one workflow node, in history order.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub node_id: String,
    pub artifacts: Vec<Vec<u8>>,
}

/// List the `images` then `videos` entries of every node in a history
/// record's `outputs` object. Entries without a `filename` are skipped.
pub fn artifact_refs(outputs: &serde_json::Map<String, serde_json::Value>) -> Vec<(String, Vec<ArtifactRef>)> {
    outputs
        .iter()
        .filter_map(|(node_id, node_output)| {
            let refs: Vec<ArtifactRef> = ["images", "videos"]
                .iter()
                .filter_map(|key| node_output.get(*key).and_then(|v| v.as_array()))
                .flatten()
                .filter_map(|entry| match serde_json::from_value::<ArtifactRef>(entry.clone()) {
                    Ok(r) => Some(r),
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, error = %e, "Skipping output entry");
                        None
                    }
                })
                .collect();

            let has_media = node_output.get("images").is_some() || node_output.get("videos").is_some();
            has_media.then(|| (node_id.clone(), refs))
        })
        .collect()
}

/// Drives one job through submit, track and collect.
pub struct ExecutionTracker {
    api: ComfyUIApi,
    config: TrackerConfig,
}

impl ExecutionTracker {
    pub fn new(api: ComfyUIApi, config: TrackerConfig) -> Self {
        Self { api, config }
    }

    /// Run a workflow to completion and return its outputs.
    ///
    /// Retryable failures reconnect the session if needed and resubmit
    /// the whole prompt; a prompt rejected by the backend or failing
    /// during execution is returned immediately.
    pub async fn run(
        &self,
        session: &mut BackendSession,
        workflow: &serde_json::Value,
    ) -> Result<Vec<NodeOutput>, TrackError> {
        if !workflow.is_object() {
            return Err(TrackError::InvalidWorkflow);
        }

        let max_attempts = self.config.submit_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.submit_and_track(session, workflow).await {
                Ok(outputs) => return Ok(outputs),
                Err(e) if !e.is_retryable() => {
                    tracing::error!(attempt, error = %e, "Prompt failed");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts, error = %e, "Prompt attempt failed");
                    last_error = e.to_string();

                    if attempt < max_attempts {
                        if !session.is_open() {
                            tracing::info!("Attempting to reconnect websocket");
                            if let Err(e) = session.connect().await {
                                tracing::error!(error = %e, "Failed to reconnect websocket");
                            }
                        }
                        tokio::time::sleep(self.config.resubmit_delay).await;
                    }
                }
            }
        }

        Err(TrackError::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn submit_and_track(
        &self,
        session: &mut BackendSession,
        workflow: &serde_json::Value,
    ) -> Result<Vec<NodeOutput>, TrackError> {
        // Events are only routed to an open connection, so it must be up
        // before the prompt is queued.
        session.connect().await?;

        let response = self
            .api
            .queue_prompt(workflow, session.client_id())
            .await
            .ok_or(TrackError::SubmitFailed)?;

        if response.has_node_errors() {
            return Err(TrackError::Rejected(response.node_errors.to_string()));
        }

        tracing::info!(prompt_id = %response.prompt_id, "Task received, tracking prompt");

        let mut execution = SubmittedExecution::new(response.prompt_id, workflow);
        self.track(session, &mut execution).await?;
        self.collect_outputs(execution.prompt_id()).await
    }

    /// Consume events until the prompt completes or the receive error
    /// budget is spent. A reconnect while tracking ends this attempt so
    /// the prompt can be resubmitted.
    pub async fn track(
        &self,
        session: &mut BackendSession,
        execution: &mut SubmittedExecution,
    ) -> Result<(), TrackError> {
        let max_errors = self.config.receive_errors.max_attempts.max(1);
        let delay = self.config.receive_errors.initial_delay;
        let mut error_count = 0u32;

        loop {
            let frame = match session.receive_event().await {
                Received::Frame(frame) => frame,
                Received::Reconnected => {
                    // Events sent while the socket was down are not replayed.
                    tracing::warn!(
                        prompt_id = %execution.prompt_id(),
                        "Websocket reconnected mid-prompt, events may be lost",
                    );
                    return Err(TrackError::ConnectionLost {
                        prompt_id: execution.prompt_id().to_string(),
                    });
                }
                Received::Lost => {
                    error_count += 1;
                    tracing::warn!(
                        prompt_id = %execution.prompt_id(),
                        "Failed to receive data from websocket (error {error_count}/{max_errors})",
                    );
                    if error_count >= max_errors {
                        return Err(TrackError::ConnectionLost {
                            prompt_id: execution.prompt_id().to_string(),
                        });
                    }
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            error_count = 0;

            match execution.apply_frame(&frame) {
                TrackStep::Continue => {}
                TrackStep::Completed => {
                    tracing::info!(prompt_id = %execution.prompt_id(), "Execution completed");
                    return Ok(());
                }
                TrackStep::Failed(reason) => {
                    return Err(TrackError::ExecutionFailed {
                        prompt_id: execution.prompt_id().to_string(),
                        reason,
                    });
                }
            }
        }
    }

    /// Fetch the history record once and download every listed output.
    pub async fn collect_outputs(&self, prompt_id: &str) -> Result<Vec<NodeOutput>, TrackError> {
        let history = self
            .api
            .get_history(prompt_id)
            .await
            .ok_or_else(|| TrackError::HistoryUnavailable(prompt_id.to_string()))?;

        let outputs = history
            .get(prompt_id)
            .and_then(|record| record.get("outputs"))
            .and_then(|outputs| outputs.as_object())
            .ok_or_else(|| TrackError::HistoryUnavailable(prompt_id.to_string()))?;

        let mut collected = Vec::new();
        for (node_id, refs) in artifact_refs(outputs) {
            let mut artifacts = Vec::with_capacity(refs.len());
            for artifact in &refs {
                let bytes = self.api.get_artifact(artifact).await;
                if bytes.is_empty() {
                    tracing::warn!(
                        node_id = %node_id,
                        filename = %artifact.filename,
                        "Artifact download failed, skipping",
                    );
                    continue;
                }
                artifacts.push(bytes);
            }
            collected.push(NodeOutput { node_id, artifacts });
        }

        Ok(collected)
    }
}

/// Errors from submitting and tracking a prompt.
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("Workflow must be a JSON object of nodes")]
    InvalidWorkflow,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Failed to queue prompt")]
    SubmitFailed,

    #[error("Prompt rejected by backend: {0}")]
    Rejected(String),

    #[error("Lost websocket while tracking prompt {prompt_id}")]
    ConnectionLost { prompt_id: String },

    #[error("Prompt {prompt_id} failed: {reason}")]
    ExecutionFailed { prompt_id: String, reason: String },

    #[error("No history record for prompt {0}")]
    HistoryUnavailable(String),

    #[error("Giving up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl TrackError {
    /// Whether a full resubmission may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Session(_) | Self::SubmitFailed | Self::ConnectionLost { .. } | Self::HistoryUnavailable(_)
        )
    }
}
