#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Malformed envelope: {0}")]
    Envelope(String),

    #[error("Malformed job metadata: {0}")]
    Metadata(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}
