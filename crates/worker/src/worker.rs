//! The queue worker loop.
//!
//! Takes one message at a time from the queue and runs it through
//! parse, optional `running` notification, runtime, upload, terminal
//! notification and acknowledgment, in that order. Every per-job failure
//! is contained here; only cancellation ends [`Worker::run`].

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use queue_agent_core::envelope::parse_job;
use queue_agent_core::naming::{output_prefix, random_tag, BlobKeys};
use queue_agent_core::notification::Notification;
use queue_agent_core::runtime::{Runtime, RuntimeOutput};
use queue_agent_core::types::Job;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::notify::Notifier;
use crate::queue::{MessageQueue, QueueMessage};
use crate::storage::BlobStore;
use crate::trace::instrument_job;

/// Messages requested per receive.
const BATCH_SIZE: i32 = 1;

/// Pause after a failed receive before polling again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Per-process settings the loop needs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub runtime_name: String,
    pub callback_when_running: bool,
    pub tracing_enabled: bool,
    /// Span name used when tracing is enabled.
    pub segment_name: String,
    pub wait_time: Duration,
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            runtime_name: config.runtime_name.clone(),
            callback_when_running: config.callback_when_running,
            tracing_enabled: config.tracing_enabled,
            segment_name: config.segment_name(),
            wait_time: config.wait_time,
        }
    }
}

/// How one delivered message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Unparsable message, acknowledged without running anything.
    Skipped,
    Completed,
    Failed,
}

pub struct Worker {
    queue: Box<dyn MessageQueue>,
    notifier: Box<dyn Notifier>,
    store: Box<dyn BlobStore>,
    runtime: Box<dyn Runtime>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: Box<dyn MessageQueue>,
        notifier: Box<dyn Notifier>,
        store: Box<dyn BlobStore>,
        runtime: Box<dyn Runtime>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            notifier,
            store,
            runtime,
            settings,
        }
    }

    /// Poll and process messages until `cancel` fires.
    ///
    /// Cancellation is observed between jobs and while waiting on the
    /// queue; a job that has started always runs to the end. The runtime
    /// is closed before returning.
    pub async fn run(&mut self, cancel: CancellationToken) {
        tracing::info!(
            runtime = %self.runtime.kind(),
            wait_secs = self.settings.wait_time.as_secs(),
            "Worker loop started",
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.queue.receive(BATCH_SIZE, self.settings.wait_time) => result,
            };

            match received {
                Ok(messages) => {
                    for message in messages {
                        self.process_message(&message).await;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Queue receive failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        self.runtime.close().await;
        tracing::info!("Worker loop stopped");
    }

    /// Process one delivery end to end, including its acknowledgment.
    pub async fn process_message(&mut self, message: &QueueMessage) -> JobOutcome {
        let enabled = self.settings.tracing_enabled;
        let segment = self.settings.segment_name.clone();
        let header = message.trace_header.clone();

        instrument_job(enabled, &segment, header.as_deref(), self.handle_message(message)).await
    }

    async fn handle_message(&mut self, message: &QueueMessage) -> JobOutcome {
        let job = match parse_job(&message.body) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(error = %e, "Error parsing message, skipping");
                tracing::debug!(body = %message.body, "Unparsable message body");
                self.acknowledge(message).await;
                return JobOutcome::Skipped;
            }
        };

        tracing::info!(job_id = %job.id, task_type = ?job.task_type, "Received task, processing");
        if !self.settings.runtime_name.is_empty() && job.runtime != self.settings.runtime_name {
            tracing::warn!(
                job_id = %job.id,
                job_runtime = %job.runtime,
                runtime_name = %self.settings.runtime_name,
                "Job targets a different runtime name, processing anyway",
            );
        }

        let prefix = output_prefix(job.prefix.as_deref(), &job.id);

        if self.settings.callback_when_running {
            let running = Notification::running(&self.settings.runtime_name, &job.id, &job.context);
            self.publish(&job.id, &running).await;
        }

        let output = self.invoke_runtime(&job).await;
        let success = output.success;

        let keys = BlobKeys::new(prefix, &job.id, &random_tag());
        let (image_url, output_url) = self.upload(&job.id, &keys, output).await;

        let terminal = Notification::terminal(
            &self.settings.runtime_name,
            &job.id,
            success,
            image_url,
            output_url,
            &job.context,
        );
        self.publish(&job.id, &terminal).await;
        self.acknowledge(message).await;

        if success {
            tracing::info!(job_id = %job.id, "Task completed");
            JobOutcome::Completed
        } else {
            tracing::error!(job_id = %job.id, "Task failed");
            JobOutcome::Failed
        }
    }

    /// Run the job on the runtime. Errors and panics become
    /// [`RuntimeOutput::failed`].
    async fn invoke_runtime(&mut self, job: &Job) -> RuntimeOutput {
        let call = self.runtime.handle(&job.id, &job.content);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::error!(job_id = %job.id, error = %e, "Error calling runtime handler");
                RuntimeOutput::failed()
            }
            Err(_) => {
                tracing::error!(job_id = %job.id, "Runtime handler panicked");
                RuntimeOutput::failed()
            }
        }
    }

    /// Upload artifacts (successful jobs only) and the status object.
    ///
    /// Returns the artifact URLs and the status object URL. Uploads that
    /// fail are logged and left out; a failed status upload yields an
    /// empty URL.
    async fn upload(
        &self,
        job_id: &str,
        keys: &BlobKeys,
        output: RuntimeOutput,
    ) -> (Vec<String>, String) {
        let mut image_url = Vec::new();

        if output.success {
            for (index, artifact) in output.artifacts.into_iter().enumerate() {
                let key = keys.artifact(index + 1);
                match self.store.store(&key, artifact).await {
                    Ok(url) => image_url.push(url),
                    Err(e) => tracing::error!(job_id, error = %e, "Artifact upload failed"),
                }
            }
        }

        let status_key = keys.status();
        let output_url = match self
            .store
            .store(&status_key, output.content.to_string().into_bytes())
            .await
        {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Status upload failed");
                String::new()
            }
        };

        (image_url, output_url)
    }

    async fn publish(&self, job_id: &str, notification: &Notification) {
        if let Err(e) = self.notifier.publish(&notification.to_json()).await {
            tracing::error!(job_id, status = ?notification.status, error = %e, "Notification failed");
        }
    }

    async fn acknowledge(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.delete(message).await {
            tracing::error!(error = %e, "Failed to delete message");
        }
    }
}
