pub mod protocol;
pub mod server;
pub mod worker;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("call timed out")]
    Timeout,

    #[error("coordinator at capacity")]
    CapacityExceeded,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol violation: {0}")]
    Protocol(String),
}
