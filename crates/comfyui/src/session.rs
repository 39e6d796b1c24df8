//! Persistent websocket session with a ComfyUI backend.
//!
//! [`BackendSession`] owns the single websocket connection a worker
//! process keeps to its backend. The `client_id` is generated once and
//! reused for every job, because ComfyUI routes execution events to the
//! connection whose id was given when the prompt was submitted.
//!
//! The session is built once at startup and owned by the runtime
//! adapter. Only the job currently being processed touches it, so no
//! locking is involved.

use std::time::Duration;

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

use crate::backoff::RetryPolicy;

/// The raw websocket stream type.
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Default number of connection attempts per [`BackendSession::connect`] call.
pub const CONNECT_ATTEMPTS: u32 = 5;

/// Default fixed delay between connection attempts.
pub const CONNECT_DELAY: Duration = Duration::from_secs(2);

/// Default number of read attempts per [`BackendSession::receive`] call.
pub const RECEIVE_ATTEMPTS: u32 = 5;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// One data frame read from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    /// Preview images. The tracker ignores these.
    Binary(Vec<u8>),
}

/// Result of [`BackendSession::receive_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Frame(Frame),
    /// The connection dropped and a new one is open. Events sent in
    /// between are gone.
    Reconnected,
    /// Every read attempt failed and the session is closed.
    Lost,
}

/// Retry budgets for connecting and reading.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Attempts and spacing for a single `connect()` call.
    pub connect: RetryPolicy,
    /// Upper bound on one websocket handshake.
    pub connect_timeout: Duration,
    /// Read attempts for a single `receive()` call.
    pub receive_attempts: u32,
    /// Pause after a failed inline reconnect inside `receive()`.
    pub receive_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect: RetryPolicy::fixed(CONNECT_ATTEMPTS, CONNECT_DELAY),
            connect_timeout: Duration::from_secs(10),
            receive_attempts: RECEIVE_ATTEMPTS,
            receive_retry_delay: CONNECT_DELAY,
        }
    }
}

/// The process-wide connection to a ComfyUI backend.
pub struct BackendSession {
    endpoint: String,
    client_id: String,
    state: ConnectionState,
    /// Attempt counter of the connect call in progress (0 when idle).
    reconnect_attempts: u32,
    stream: Option<WsStream>,
    config: SessionConfig,
}

impl BackendSession {
    /// Create a closed session for `endpoint` (`host:port`).
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_config(endpoint, SessionConfig::default())
    }

    pub fn with_config(endpoint: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
            state: ConnectionState::Closed,
            reconnect_attempts: 0,
            stream: None,
            config,
        }
    }

    /// Identity sent in the handshake and with every prompt submission.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Backend endpoint as `host:port`.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open && self.stream.is_some()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws?clientId={}", self.endpoint, self.client_id)
    }

    /// Open the websocket if it is not already open.
    ///
    /// Makes up to `config.connect.max_attempts` attempts separated by
    /// the policy delay, then gives up with [`SessionError::Exhausted`].
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.is_open() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let url = self.ws_url();
        let max_attempts = self.config.connect.max_attempts.max(1);
        let delays = self.config.connect.delays();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            self.reconnect_attempts = attempt;
            tracing::info!(
                endpoint = %self.endpoint,
                attempt,
                max_attempts,
                "Connecting to ComfyUI websocket",
            );

            let handshake = connect_async(url.as_str());
            match tokio::time::timeout(self.config.connect_timeout, handshake).await {
                Ok(Ok((ws_stream, _response))) => {
                    self.stream = Some(ws_stream);
                    self.state = ConnectionState::Open;
                    self.reconnect_attempts = 0;
                    tracing::info!(
                        endpoint = %self.endpoint,
                        client_id = %self.client_id,
                        "Connected to ComfyUI websocket",
                    );
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "handshake timed out".to_string(),
            }

            tracing::warn!(
                endpoint = %self.endpoint,
                attempt,
                error = %last_error,
                "Websocket connect attempt failed",
            );

            if let Some(delay) = delays.get(attempt as usize - 1) {
                tokio::time::sleep(*delay).await;
            }
        }

        self.state = ConnectionState::Closed;
        self.reconnect_attempts = 0;
        tracing::error!(
            endpoint = %self.endpoint,
            attempts = max_attempts,
            "Max websocket connection attempts reached",
        );

        Err(SessionError::Exhausted {
            endpoint: self.endpoint.clone(),
            attempts: max_attempts,
            last_error,
        })
    }

    /// Read the next data frame.
    ///
    /// A closed or broken connection is reconnected inline and the read
    /// retried, up to `config.receive_attempts` reads in total. Returns
    /// `None` once that budget is spent.
    pub async fn receive(&mut self) -> Option<Frame> {
        match self.read_with_retries(false).await {
            Received::Frame(frame) => Some(frame),
            Received::Reconnected | Received::Lost => None,
        }
    }

    /// Like [`receive`](Self::receive), but stops as soon as an inline
    /// reconnect succeeds.
    ///
    /// The backend does not replay events sent while the connection was
    /// down, so a caller following one prompt must learn about the gap
    /// instead of waiting on the new connection.
    pub async fn receive_event(&mut self) -> Received {
        self.read_with_retries(true).await
    }

    async fn read_with_retries(&mut self, stop_on_reconnect: bool) -> Received {
        let max_attempts = self.config.receive_attempts.max(1);
        let mut attempt = 0u32;

        while attempt < max_attempts {
            let failure = match self.read_frame().await {
                Ok(frame) => return Received::Frame(frame),
                Err(reason) => reason,
            };

            attempt += 1;
            self.mark_closed();
            tracing::warn!(
                endpoint = %self.endpoint,
                attempt,
                max_attempts,
                reason = %failure,
                "Websocket read failed",
            );

            if attempt >= max_attempts {
                break;
            }

            match self.connect().await {
                Ok(()) if stop_on_reconnect => return Received::Reconnected,
                Ok(()) => tracing::info!("Reconnected, retrying receive"),
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect failed during receive");
                    tokio::time::sleep(self.config.receive_retry_delay).await;
                }
            }
        }

        tracing::error!(
            endpoint = %self.endpoint,
            attempts = max_attempts,
            "Max receive attempts reached",
        );
        Received::Lost
    }

    /// Drop the current stream and mark the session closed.
    pub fn mark_closed(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Closed;
    }

    /// Send a close frame and drop the connection.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                tracing::debug!(error = %e, "Error closing websocket");
            }
        }
        self.state = ConnectionState::Closed;
    }

    /// Read one data frame from the open stream, skipping control frames.
    async fn read_frame(&mut self) -> Result<Frame, String> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| "connection is closed".to_string())?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text)),
                Some(Ok(Message::Binary(bytes))) => return Ok(Frame::Binary(bytes)),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    return Err(format!("closed by backend: {frame:?}"));
                }
                Some(Err(e)) => return Err(e.to_string()),
                None => return Err("stream ended".to_string()),
            }
        }
    }
}

/// Errors from the websocket session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Every connection attempt failed.
    #[error("Failed to connect to ComfyUI at {endpoint} after {attempts} attempts: {last_error}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },
}
