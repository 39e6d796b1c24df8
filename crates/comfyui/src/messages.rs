//! Decoding of ComfyUI websocket events.
//!
//! Every text frame is `{"type": "<kind>", "data": {...}}` and becomes
//! one [`ComfyUIMessage`]. Kinds the tracker does not know decode to
//! [`ComfyUIMessage::Other`]; a known kind whose payload is missing
//! required keys is a parse error.

use serde::{Deserialize, Deserializer};

/// One decoded websocket event.
#[derive(Debug, Clone)]
pub enum ComfyUIMessage {
    /// Queue depth broadcast.
    Status(StatusData),

    ExecutionStart(ExecutionStartData),

    /// Nodes answered from cache; they count as finished.
    ExecutionCached(ExecutionCachedData),

    /// `node: None` marks the end of the prompt named by `prompt_id`.
    Executing(ExecutingData),

    /// Sampler step counter.
    Progress(ProgressData),

    Executed(ExecutedData),

    /// The backend gave up on a prompt.
    ExecutionError(ErrorData),

    /// Any other event kind, carried by name only.
    Other(String),
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    pub nodes: Vec<String>,
}

/// `node` is required but may be `null`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    #[serde(deserialize_with = "nullable_node")]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i64,
    pub max: i64,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    #[serde(default)]
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

fn nullable_node<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
}

/// Decode one text frame. Unknown kinds are not an error.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let raw: RawMessage = serde_json::from_str(text)?;
    let data = raw.data;

    let msg = match raw.kind.as_str() {
        "status" => ComfyUIMessage::Status(serde_json::from_value(data)?),
        "execution_start" => ComfyUIMessage::ExecutionStart(serde_json::from_value(data)?),
        "execution_cached" => ComfyUIMessage::ExecutionCached(serde_json::from_value(data)?),
        "executing" => ComfyUIMessage::Executing(serde_json::from_value(data)?),
        "progress" => ComfyUIMessage::Progress(serde_json::from_value(data)?),
        "executed" => ComfyUIMessage::Executed(serde_json::from_value(data)?),
        "execution_error" => ComfyUIMessage::ExecutionError(serde_json::from_value(data)?),
        _ => ComfyUIMessage::Other(raw.kind),
    };

    Ok(msg)
}
