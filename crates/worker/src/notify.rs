//! Result topic.

use async_trait::async_trait;
use aws_sdk_sns::error::DisplayErrorContext;

#[derive(Debug, thiserror::Error)]
#[error("Failed to publish notification: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, message: &str) -> Result<(), NotifyError>;
}

/// [`Notifier`] backed by an SNS topic.
pub struct SnsNotifier {
    client: aws_sdk_sns::Client,
    topic_arn: String,
}

impl SnsNotifier {
    pub fn new(client: aws_sdk_sns::Client, topic_arn: impl Into<String>) -> Self {
        Self {
            client,
            topic_arn: topic_arn.into(),
        }
    }
}

#[async_trait]
impl Notifier for SnsNotifier {
    async fn publish(&self, message: &str) -> Result<(), NotifyError> {
        let output = self
            .client
            .publish()
            .topic_arn(&self.topic_arn)
            .message(message)
            .send()
            .await
            .map_err(|e| NotifyError(DisplayErrorContext(e).to_string()))?;
        tracing::debug!(message_id = ?output.message_id(), "Notification published");
        Ok(())
    }
}
