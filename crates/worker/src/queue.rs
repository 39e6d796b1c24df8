//! Durable job queue.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageSystemAttributeName;

/// One delivery taken from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub body: String,
    /// Handle used to acknowledge this delivery.
    pub receipt_handle: String,
    /// Propagated `AWSTraceHeader` attribute, if the producer set one.
    pub trace_header: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to receive messages: {0}")]
    Receive(String),

    #[error("Failed to delete message: {0}")]
    Delete(String),
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Long-poll for up to `max` messages, waiting at most `wait`.
    async fn receive(&self, max: i32, wait: Duration) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a delivery so it is not redelivered.
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError>;
}

/// [`MessageQueue`] backed by an SQS queue.
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn receive(&self, max: i32, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max)
            .wait_time_seconds(wait.as_secs() as i32)
            .message_system_attribute_names(MessageSystemAttributeName::AwsTraceHeader)
            .send()
            .await
            .map_err(|e| QueueError::Receive(DisplayErrorContext(e).to_string()))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|m| {
                let Some(receipt_handle) = m.receipt_handle() else {
                    tracing::warn!(message_id = ?m.message_id(), "Message without receipt handle");
                    return None;
                };
                let trace_header = m
                    .attributes()
                    .and_then(|attrs| attrs.get(&MessageSystemAttributeName::AwsTraceHeader))
                    .cloned();
                Some(QueueMessage {
                    body: m.body().unwrap_or_default().to_string(),
                    receipt_handle: receipt_handle.to_string(),
                    trace_header,
                })
            })
            .collect();

        Ok(messages)
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&message.receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Delete(DisplayErrorContext(e).to_string()))?;
        Ok(())
    }
}
