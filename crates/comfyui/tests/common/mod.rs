//! Fake ComfyUI backend for integration tests.
//!
//! Serves `/ws`, `/prompt`, `/history/{prompt_id}` and `/view` on an
//! ephemeral loopback port. Each `POST /prompt` pops the next [`Script`]
//! and queues its websocket actions; whichever websocket is connected
//! drains that queue, so a scripted `Close` hands the remaining events
//! to the next connection just like ComfyUI does for a returning
//! `clientId`.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use queue_agent_comfyui::api::ComfyUIApi;
use queue_agent_comfyui::backoff::RetryPolicy;
use queue_agent_comfyui::runtime::ComfyUIRuntime;
use queue_agent_comfyui::session::{BackendSession, SessionConfig};
use queue_agent_comfyui::tracker::{ExecutionTracker, TrackerConfig};

/// Placeholder replaced with the assigned prompt id in scripted events.
pub const PROMPT: &str = "__PROMPT__";

#[derive(Debug, Clone)]
pub enum WsAction {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// What the backend does for one submitted prompt.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub actions: Vec<WsAction>,
    /// `outputs` object of the history record. `None` leaves no record.
    pub outputs: Option<Value>,
    pub node_errors: Option<Value>,
}

pub fn event(kind: &str, data: Value) -> WsAction {
    WsAction::Text(json!({"type": kind, "data": data}).to_string())
}

/// The usual event sequence for a three-node workflow.
pub fn completion_events() -> Vec<WsAction> {
    vec![
        event("status", json!({"status": {"exec_info": {"queue_remaining": 1}}})),
        event("execution_start", json!({"prompt_id": PROMPT})),
        event("execution_cached", json!({"prompt_id": PROMPT, "nodes": ["4"]})),
        event("executing", json!({"node": "3", "prompt_id": PROMPT})),
        event("progress", json!({"value": 1, "max": 2})),
        event("progress", json!({"value": 2, "max": 2})),
        WsAction::Binary(vec![0, 0, 0, 1]),
        event("executing", json!({"node": "9", "prompt_id": PROMPT})),
        event("executing", json!({"node": null, "prompt_id": PROMPT})),
    ]
}

pub fn image_outputs(names: &[&str]) -> Value {
    let images: Vec<Value> = names
        .iter()
        .map(|n| json!({"filename": n, "subfolder": "", "type": "output"}))
        .collect();
    json!({"9": {"images": images}})
}

pub fn workflow() -> Value {
    json!({
        "3": {"class_type": "KSampler", "inputs": {"steps": 2}},
        "4": {"class_type": "CheckpointLoaderSimple", "inputs": {}},
        "9": {"class_type": "SaveImage", "inputs": {}}
    })
}

pub struct FakeState {
    ws_tx: mpsc::UnboundedSender<WsAction>,
    ws_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WsAction>>,
    scripts: Mutex<VecDeque<Script>>,
    history: Mutex<HashMap<String, Value>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    prompts: Mutex<Vec<Value>>,
    client_ids: Mutex<Vec<String>>,
    pub ws_connects: AtomicUsize,
    pub prompt_calls: AtomicUsize,
    refuse_ws_after: AtomicUsize,
    accept_ws_from: AtomicUsize,
    prompt_status: AtomicU16,
}

pub struct FakeComfyUI {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
}

impl FakeComfyUI {
    pub async fn start(scripts: Vec<Script>) -> Self {
        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        let state = Arc::new(FakeState {
            ws_tx,
            ws_rx: tokio::sync::Mutex::new(ws_rx),
            scripts: Mutex::new(scripts.into()),
            history: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            prompts: Mutex::new(Vec::new()),
            client_ids: Mutex::new(Vec::new()),
            ws_connects: AtomicUsize::new(0),
            prompt_calls: AtomicUsize::new(0),
            refuse_ws_after: AtomicUsize::new(usize::MAX),
            accept_ws_from: AtomicUsize::new(usize::MAX),
            prompt_status: AtomicU16::new(200),
        });

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/prompt", post(prompt_handler))
            .route("/history/{prompt_id}", get(history_handler))
            .route("/view", get(view_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn add_file(&self, name: &str, bytes: &[u8]) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes.to_vec());
    }

    /// Queue an action for the connected websocket outside any prompt.
    pub fn push_ws(&self, action: WsAction) {
        let _ = self.state.ws_tx.send(action);
    }

    /// Handshakes after the first `n` are answered with 503.
    pub fn refuse_ws_after(&self, n: usize) {
        self.state.refuse_ws_after.store(n, Ordering::SeqCst);
    }

    /// Handshakes from the `n`th on are accepted again.
    pub fn accept_ws_from(&self, n: usize) {
        self.state.accept_ws_from.store(n, Ordering::SeqCst);
    }

    pub fn fail_prompts_with(&self, status: u16) {
        self.state.prompt_status.store(status, Ordering::SeqCst);
    }

    pub fn ws_connects(&self) -> usize {
        self.state.ws_connects.load(Ordering::SeqCst)
    }

    pub fn prompt_calls(&self) -> usize {
        self.state.prompt_calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Value> {
        self.state.prompts.lock().unwrap().clone()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state.client_ids.lock().unwrap().clone()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<FakeState>>,
) -> Response {
    let n = state.ws_connects.fetch_add(1, Ordering::SeqCst) + 1;
    let refused = n > state.refuse_ws_after.load(Ordering::SeqCst)
        && n < state.accept_ws_from.load(Ordering::SeqCst);
    if refused {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if let Some(id) = params.get("clientId") {
        state.client_ids.lock().unwrap().push(id.clone());
    }
    ws.on_upgrade(move |socket| forward(socket, state))
}

async fn forward(mut socket: WebSocket, state: Arc<FakeState>) {
    let mut rx = state.ws_rx.lock().await;
    loop {
        tokio::select! {
            action = rx.recv() => match action {
                Some(WsAction::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Some(WsAction::Binary(bytes)) => {
                    if socket.send(Message::Binary(bytes.into())).await.is_err() {
                        return;
                    }
                }
                Some(WsAction::Close) | None => {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn prompt_handler(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Response {
    state.prompt_calls.fetch_add(1, Ordering::SeqCst);

    let status = state.prompt_status.load(Ordering::SeqCst);
    if status != 200 {
        let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (code, "backend error").into_response();
    }

    let number = {
        let mut prompts = state.prompts.lock().unwrap();
        prompts.push(body);
        prompts.len()
    };
    let prompt_id = format!("prompt-{number}");
    let script = state.scripts.lock().unwrap().pop_front().unwrap_or_default();

    if let Some(outputs) = script.outputs {
        state
            .history
            .lock()
            .unwrap()
            .insert(prompt_id.clone(), json!({"outputs": outputs}));
    }

    for action in script.actions {
        let action = match action {
            WsAction::Text(text) => WsAction::Text(text.replace(PROMPT, &prompt_id)),
            other => other,
        };
        let _ = state.ws_tx.send(action);
    }

    Json(json!({
        "prompt_id": prompt_id,
        "number": number,
        "node_errors": script.node_errors.unwrap_or_else(|| json!({})),
    }))
    .into_response()
}

async fn history_handler(
    Path(prompt_id): Path<String>,
    State(state): State<Arc<FakeState>>,
) -> Json<Value> {
    let history = state.history.lock().unwrap();
    let mut body = serde_json::Map::new();
    if let Some(record) = history.get(&prompt_id) {
        body.insert(prompt_id, record.clone());
    }
    Json(Value::Object(body))
}

async fn view_handler(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<FakeState>>,
) -> Response {
    let files = state.files.lock().unwrap();
    match params.get("filename").and_then(|name| files.get(name)) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        connect: RetryPolicy::fixed(2, Duration::from_millis(10)),
        connect_timeout: Duration::from_secs(2),
        receive_attempts: 3,
        receive_retry_delay: Duration::from_millis(10),
    }
}

pub fn fast_tracker_config() -> TrackerConfig {
    TrackerConfig {
        receive_errors: RetryPolicy::fixed(2, Duration::from_millis(10)),
        submit_attempts: 3,
        resubmit_delay: Duration::from_millis(10),
    }
}

pub fn fast_http_policy() -> RetryPolicy {
    RetryPolicy::fixed(2, Duration::from_millis(10))
}

pub fn fast_session(endpoint: &str) -> BackendSession {
    BackendSession::with_config(endpoint, fast_session_config())
}

pub fn fast_tracker(endpoint: &str) -> ExecutionTracker {
    ExecutionTracker::new(
        ComfyUIApi::new(endpoint, fast_http_policy()),
        fast_tracker_config(),
    )
}

pub fn fast_runtime(endpoint: &str) -> ComfyUIRuntime {
    ComfyUIRuntime::with_parts(fast_session(endpoint), fast_tracker(endpoint))
}
