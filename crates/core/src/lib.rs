//! Shared domain types for the queue agent.
//!
//! Holds the job model decoded from queue envelopes, the outbound
//! notification payload, blob key naming, and the [`runtime::Runtime`]
//! capability trait implemented by rendering backends.

pub mod envelope;
pub mod error;
pub mod naming;
pub mod notification;
pub mod runtime;
pub mod types;
