use thiserror::Error;

/// Error kinds surfaced by the adapter, per the runtime's error-handling design.
///
/// Mid-generation errors always invalidate the prompt cache before
/// propagating — callers can rely on the next request starting from a
/// clean KV state regardless of which variant they see.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to initialize native resource: {0}")]
    NativeInit(String),

    #[error("context window full: {0}")]
    KvOverflow(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("tokenization failed: {0}")]
    Tokenization(String),

    #[error("vision error: {0}")]
    Vision(String),

    #[error("generation cancelled")]
    Cancelled,

    #[error("stream callback error: {0}")]
    StreamCallback(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;
