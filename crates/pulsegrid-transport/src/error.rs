//! Transport error types.

use thiserror::Error;

/// Errors raised while starting a transport or moving one payload.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport already running: {0}")]
    AlreadyRunning(String),

    #[error("node {0} is not a cluster member")]
    UnknownNode(String),

    #[error("invalid address: {0}")]
    Addr(String),

    #[error("payload of {len} bytes exceeds {max}")]
    TooLarge { len: usize, max: usize },

    #[error("http error: {0}")]
    Http(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] pulse_core::ConfigError),
}

pub type TransportResult<T> = Result<T, TransportError>;
