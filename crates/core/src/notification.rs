//! Outbound status notifications published to the result topic.

use serde::Serialize;

/// Lifecycle status reported for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// Notification payload.
///
/// `running` notifications carry only the identity fields; terminal
/// ones add the result flag and the uploaded object URLs.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub runtime: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<bool>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    pub context: serde_json::Value,
}

impl Notification {
    /// Intermediate notification sent before the runtime is invoked.
    pub fn running(runtime: &str, id: &str, context: &serde_json::Value) -> Self {
        Self {
            runtime: runtime.to_string(),
            id: id.to_string(),
            result: None,
            status: JobStatus::Running,
            image_url: None,
            output_url: None,
            context: context.clone(),
        }
    }

    /// Terminal notification. `success` picks `completed` or `failed`.
    pub fn terminal(
        runtime: &str,
        id: &str,
        success: bool,
        image_url: Vec<String>,
        output_url: String,
        context: &serde_json::Value,
    ) -> Self {
        Self {
            runtime: runtime.to_string(),
            id: id.to_string(),
            result: Some(success),
            status: if success {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            },
            image_url: Some(image_url),
            output_url: Some(output_url),
            context: context.clone(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
