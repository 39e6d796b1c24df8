//! Best-effort trace instrumentation around message processing.
//!
//! When enabled, each message is processed inside a span named after the
//! runtime. A propagated `AWSTraceHeader` links the span to the
//! producer's trace. Nothing here can fail the job: a header that does
//! not parse only drops the instrumentation.

use std::future::Future;

use tracing::field::Empty;
use tracing::Instrument;

/// Parsed `Root=...;Parent=...;Sampled=...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHeader {
    pub root: String,
    pub parent: Option<String>,
    pub sampled: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid trace header: {0}")]
pub struct InvalidTraceHeader(String);

impl TraceHeader {
    pub fn parse(raw: &str) -> Result<Self, InvalidTraceHeader> {
        let mut root = None;
        let mut parent = None;
        let mut sampled = None;

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| InvalidTraceHeader(format!("malformed field '{part}'")))?;
            match key {
                "Root" => root = Some(value.to_string()),
                "Parent" => parent = Some(value.to_string()),
                "Sampled" => {
                    sampled = match value {
                        "1" => Some(true),
                        "0" => Some(false),
                        _ => None,
                    }
                }
                // Lineage and vendor fields are carried but not used.
                _ => {}
            }
        }

        let root = root.ok_or_else(|| InvalidTraceHeader("missing Root".into()))?;
        if !is_valid_root(&root) {
            return Err(InvalidTraceHeader(format!("bad Root '{root}'")));
        }

        Ok(Self {
            root,
            parent,
            sampled,
        })
    }
}

/// `1-{8 hex}-{24 hex}`
fn is_valid_root(root: &str) -> bool {
    let parts: Vec<&str> = root.split('-').collect();
    matches!(parts.as_slice(), ["1", time, id]
        if time.len() == 8
            && id.len() == 24
            && time.chars().chain(id.chars()).all(|c| c.is_ascii_hexdigit()))
}

/// Run `fut` inside a span named `segment_name` when tracing is enabled.
///
/// The inner output is returned unchanged in every case.
pub async fn instrument_job<F>(
    enabled: bool,
    segment_name: &str,
    trace_header: Option<&str>,
    fut: F,
) -> F::Output
where
    F: Future,
{
    if !enabled {
        return fut.await;
    }

    let span = tracing::info_span!(
        "job_segment",
        segment = %segment_name,
        trace_root = Empty,
        trace_parent = Empty,
        sampled = Empty,
    );

    if let Some(raw) = trace_header {
        match TraceHeader::parse(raw) {
            Ok(header) => {
                span.record("trace_root", header.root.as_str());
                if let Some(parent) = &header.parent {
                    span.record("trace_parent", parent.as_str());
                }
                if let Some(sampled) = header.sampled {
                    span.record("sampled", sampled);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Processing message without trace instrumentation");
                return fut.await;
            }
        }
    }

    fut.instrument(span).await
}
