//! Job model as seen by the worker once an envelope has been unwrapped.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum accepted length of a producer-assigned job id.
const MAX_JOB_ID_LEN: usize = 256;

/// Kind of generation work requested by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    TextToImage,
    ImageToImage,
    ExtraSingleImage,
}

/// A dequeued generation job. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Producer-assigned id. Shape-checked, not checked for uniqueness.
    pub id: String,
    /// Runtime name the producer addressed the job to.
    pub runtime: String,
    pub task_type: Option<TaskType>,
    /// Output prefix supplied by the producer, if any.
    pub prefix: Option<String>,
    /// Opaque caller context echoed back in every notification.
    pub context: serde_json::Value,
    /// Backend-specific payload handed to the runtime untouched.
    pub content: serde_json::Value,
}

/// `metadata` object of the inner job document.
#[derive(Debug, Deserialize)]
pub(crate) struct JobMetadata {
    pub id: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub tasktype: Option<TaskType>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// Inner job document: `{"metadata": {...}, "content": ...}`.
#[derive(Debug, Deserialize)]
pub(crate) struct JobDocument {
    pub metadata: JobMetadata,
    pub content: serde_json::Value,
}

impl TryFrom<JobDocument> for Job {
    type Error = CoreError;

    fn try_from(doc: JobDocument) -> Result<Self, Self::Error> {
        validate_job_id(&doc.metadata.id)?;

        let prefix = doc.metadata.prefix.filter(|p| !p.is_empty());

        Ok(Self {
            id: doc.metadata.id,
            runtime: doc.metadata.runtime,
            task_type: doc.metadata.tasktype,
            prefix,
            context: doc
                .metadata
                .context
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            content: doc.content,
        })
    }
}

/// Job ids are alphanumeric plus `-` and `_`. They end up in blob keys,
/// so anything else is rejected.
pub fn validate_job_id(id: &str) -> Result<(), CoreError> {
    let well_formed = !id.is_empty()
        && id.len() <= MAX_JOB_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if well_formed {
        Ok(())
    } else {
        Err(CoreError::Validation(format!("Invalid job id '{id}'")))
    }
}
