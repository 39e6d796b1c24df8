//! [`Runtime`] implementation for ComfyUI.
//!
//! Owns the process-wide [`BackendSession`] and an [`ExecutionTracker`].
//! Each job's `content` is the ComfyUI workflow (API format); the
//! outputs of all nodes are flattened into the artifact list in history
//! order.

use async_trait::async_trait;
use queue_agent_core::runtime::{Runtime, RuntimeError, RuntimeKind, RuntimeOutput};

use crate::api::ComfyUIApi;
use crate::backoff::RetryPolicy;
use crate::session::BackendSession;
use crate::tracker::{ExecutionTracker, TrackError, TrackerConfig};

pub struct ComfyUIRuntime {
    session: BackendSession,
    tracker: ExecutionTracker,
}

impl ComfyUIRuntime {
    /// Runtime for `endpoint` (`host:port`) with default budgets.
    pub fn new(endpoint: &str) -> Self {
        Self::with_parts(
            BackendSession::new(endpoint),
            ExecutionTracker::new(
                ComfyUIApi::new(endpoint, RetryPolicy::default()),
                TrackerConfig::default(),
            ),
        )
    }

    pub fn with_parts(session: BackendSession, tracker: ExecutionTracker) -> Self {
        Self { session, tracker }
    }

    pub fn session(&self) -> &BackendSession {
        &self.session
    }
}

impl From<TrackError> for RuntimeError {
    fn from(e: TrackError) -> Self {
        match e {
            TrackError::InvalidWorkflow | TrackError::Rejected(_) => {
                RuntimeError::InvalidPayload(e.to_string())
            }
            TrackError::Session(_) => RuntimeError::Unavailable(e.to_string()),
            _ => RuntimeError::Execution(e.to_string()),
        }
    }
}

#[async_trait]
impl Runtime for ComfyUIRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::ComfyUI
    }

    async fn check_readiness(&mut self) -> Result<(), RuntimeError> {
        tracing::info!(endpoint = %self.session.endpoint(), "Checking ComfyUI readiness");
        self.session
            .connect()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        tracing::info!(endpoint = %self.session.endpoint(), "ComfyUI backend connected");
        Ok(())
    }

    async fn handle(
        &mut self,
        job_id: &str,
        content: &serde_json::Value,
    ) -> Result<RuntimeOutput, RuntimeError> {
        tracing::info!(job_id, "Processing pipeline task");

        let outputs = self.tracker.run(&mut self.session, content).await?;
        let artifacts: Vec<Vec<u8>> = outputs.into_iter().flat_map(|n| n.artifacts).collect();

        tracing::info!(job_id, count = artifacts.len(), "Pipeline task finished");
        Ok(RuntimeOutput::completed(artifacts))
    }

    async fn close(&mut self) {
        tracing::info!(endpoint = %self.session.endpoint(), "Closing ComfyUI websocket");
        self.session.close().await;
    }
}
