//! ComfyUI websocket and REST client library.
//!
//! Provides typed websocket event parsing, a reconnecting backend
//! session, a retrying HTTP caller for the REST endpoints, the
//! execution tracker that follows a submitted prompt to completion, and
//! the [`runtime::ComfyUIRuntime`] adapter that ties them together for
//! the queue worker.

pub mod api;
pub mod backoff;
pub mod messages;
pub mod runtime;
pub mod session;
pub mod tracker;
