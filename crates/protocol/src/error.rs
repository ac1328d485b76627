/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty frame")]
    EmptyFrame,

    #[error("invalid chunk header: {0}")]
    InvalidHeader(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
}
