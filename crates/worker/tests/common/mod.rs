//! In-memory collaborators and a scripted runtime for worker tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use queue_agent::notify::{NotifyError, Notifier};
use queue_agent::queue::{MessageQueue, QueueError, QueueMessage};
use queue_agent::storage::{BlobStore, StorageError};
use queue_agent::worker::{Worker, WorkerSettings};
use queue_agent_core::runtime::{Runtime, RuntimeError, RuntimeKind, RuntimeOutput};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Queue body for a job: the topic wrapper around the inner document.
pub fn job_body(metadata: Value, content: Value) -> String {
    let inner = json!({"metadata": metadata, "content": content}).to_string();
    json!({"Type": "Notification", "Message": inner}).to_string()
}

pub fn message(body: impl Into<String>, receipt: &str) -> QueueMessage {
    QueueMessage {
        body: body.into(),
        receipt_handle: receipt.to_string(),
        trace_header: None,
    }
}

pub fn demo_job(id: &str, receipt: &str) -> QueueMessage {
    message(
        job_body(
            json!({
                "id": id,
                "runtime": "demo",
                "tasktype": "text-to-image",
                "prefix": "out",
                "context": {"user": "u-1"}
            }),
            json!({"3": {"class_type": "KSampler"}}),
        ),
        receipt,
    )
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryQueue {
    pending: Arc<Mutex<VecDeque<QueueMessage>>>,
    deleted: Arc<Mutex<Vec<String>>>,
}

impl MemoryQueue {
    pub fn push(&self, message: QueueMessage) {
        self.pending.lock().unwrap().push_back(message);
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn receive(&self, max: i32, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        let batch: Vec<QueueMessage> = {
            let mut pending = self.pending.lock().unwrap();
            let n = (max.max(0) as usize).min(pending.len());
            pending.drain(..n).collect()
        };
        if batch.is_empty() {
            // Stand-in for the long poll.
            tokio::time::sleep(wait.min(Duration::from_millis(5))).await;
        }
        Ok(batch)
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.deleted
            .lock()
            .unwrap()
            .push(message.receipt_handle.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryNotifier {
    published: Arc<Mutex<Vec<Value>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryNotifier {
    pub fn published(&self) -> Vec<Value> {
        self.published.lock().unwrap().clone()
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn publish(&self, message: &str) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError("topic unavailable".into()));
        }
        let value = serde_json::from_str(message).map_err(|e| NotifyError(e.to_string()))?;
        self.published.lock().unwrap().push(value);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn objects(&self) -> Vec<(String, Vec<u8>)> {
        self.objects.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects().into_iter().map(|(k, _)| k).collect()
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Upload {
                key: key.to_string(),
                reason: "bucket unavailable".into(),
            });
        }
        self.objects.lock().unwrap().push((key.to_string(), bytes));
        Ok(format!("s3://test-bucket/{key}"))
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub enum Behavior {
    Succeed(Vec<Vec<u8>>),
    Fail(RuntimeError),
    Panic,
}

/// Runtime that plays back one [`Behavior`] per call. Succeeds with no
/// artifacts once the script runs out.
#[derive(Clone, Default)]
pub struct ScriptedRuntime {
    script: Arc<Mutex<VecDeque<Behavior>>>,
    calls: Arc<Mutex<Vec<String>>>,
    started: Arc<Notify>,
    closed: Arc<AtomicBool>,
    delay: Duration,
}

impl ScriptedRuntime {
    pub fn new(script: Vec<Behavior>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Default::default()
        }
    }

    /// Hold each call for `delay` after signalling [`Self::started`].
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn started(&self) -> Arc<Notify> {
        Arc::clone(&self.started)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runtime for ScriptedRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::ComfyUI
    }

    async fn check_readiness(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn handle(
        &mut self,
        job_id: &str,
        _content: &Value,
    ) -> Result<RuntimeOutput, RuntimeError> {
        self.calls.lock().unwrap().push(job_id.to_string());
        self.started.notify_one();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Behavior::Succeed(artifacts)) => Ok(RuntimeOutput::completed(artifacts)),
            Some(Behavior::Fail(e)) => Err(e),
            Some(Behavior::Panic) => panic!("backend adapter blew up"),
            None => Ok(RuntimeOutput::completed(Vec::new())),
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub queue: MemoryQueue,
    pub notifier: MemoryNotifier,
    pub store: MemoryStore,
    pub runtime: ScriptedRuntime,
}

impl Harness {
    pub fn new(runtime: ScriptedRuntime) -> Self {
        Self {
            queue: MemoryQueue::default(),
            notifier: MemoryNotifier::default(),
            store: MemoryStore::default(),
            runtime,
        }
    }

    pub fn worker(&self, settings: WorkerSettings) -> Worker {
        Worker::new(
            Box::new(self.queue.clone()),
            Box::new(self.notifier.clone()),
            Box::new(self.store.clone()),
            Box::new(self.runtime.clone()),
            settings,
        )
    }
}

pub fn settings() -> WorkerSettings {
    WorkerSettings {
        runtime_name: "demo".into(),
        callback_when_running: false,
        tracing_enabled: true,
        segment_name: "demo-queue-agent".into(),
        wait_time: Duration::from_millis(5),
    }
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
