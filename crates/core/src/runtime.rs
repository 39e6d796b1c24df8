//! Runtime adapter capability.
//!
//! A process serves exactly one backend for its lifetime. The worker
//! holds it as `Box<dyn Runtime>` and calls [`Runtime::handle`] once per
//! job. Errors returned from `handle` are converted by the worker into
//! [`RuntimeOutput::failed`], so an adapter never has to build its own
//! failure payload.

use std::str::FromStr;

use async_trait::async_trait;

/// Backend families a worker can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Websocket-tracked ComfyUI backend.
    ComfyUI,
    /// Stateless request/response backend.
    SdWebUI,
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "comfyui" => Ok(Self::ComfyUI),
            "sdwebui" => Ok(Self::SdWebUI),
            other => Err(format!("Unknown runtime type '{other}'")),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ComfyUI => f.write_str("comfyui"),
            Self::SdWebUI => f.write_str("sdwebui"),
        }
    }
}

/// What a runtime produced for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeOutput {
    pub success: bool,
    /// Artifact bytes in backend output order.
    pub artifacts: Vec<Vec<u8>>,
    /// Status payload uploaded as the `.out` object.
    pub content: serde_json::Value,
}

impl RuntimeOutput {
    pub fn completed(artifacts: Vec<Vec<u8>>) -> Self {
        Self {
            success: true,
            artifacts,
            content: serde_json::json!({"code": 200}),
        }
    }

    /// Generic failure result. Never carries internal error text.
    pub fn failed() -> Self {
        Self {
            success: false,
            artifacts: Vec::new(),
            content: serde_json::json!({"code": 500, "error": "Runtime handler failed"}),
        }
    }
}

/// Errors surfaced at the adapter boundary.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The backend could not be reached.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend was reached but the job did not complete.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The job payload was not acceptable to this runtime.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

#[async_trait]
pub trait Runtime: Send {
    /// Backend family of this adapter.
    fn kind(&self) -> RuntimeKind;

    /// Startup check. Failing here aborts the process before any queue
    /// traffic is consumed.
    async fn check_readiness(&mut self) -> Result<(), RuntimeError>;

    /// Run one job to completion.
    async fn handle(
        &mut self,
        job_id: &str,
        content: &serde_json::Value,
    ) -> Result<RuntimeOutput, RuntimeError>;

    /// Release backend connections once the worker stops taking jobs.
    async fn close(&mut self) {}
}
