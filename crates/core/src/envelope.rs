//! Queue envelope decoding.
//!
//! Jobs reach the queue through a topic subscription, so the message
//! body is a notification wrapper whose `Message` field is itself a JSON
//! string holding `{"metadata": {...}, "content": ...}`.

use serde::Deserialize;

use crate::error::CoreError;
use crate::types::{Job, JobDocument};

#[derive(Debug, Deserialize)]
struct NotificationWrapper {
    #[serde(rename = "Message")]
    message: String,
}

/// Decode a raw queue message body into a [`Job`].
///
/// Any failure here means the message is malformed; callers drop it
/// without retrying.
pub fn parse_job(body: &str) -> Result<Job, CoreError> {
    let wrapper: NotificationWrapper =
        serde_json::from_str(body).map_err(|e| CoreError::Envelope(e.to_string()))?;

    let doc: JobDocument = serde_json::from_str(&wrapper.message)
        .map_err(|e| CoreError::Metadata(e.to_string()))?;

    Job::try_from(doc)
}
