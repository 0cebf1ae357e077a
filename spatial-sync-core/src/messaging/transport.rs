//! Transport seam for the message bus

use thiserror::Error;

/// Send failures surfaced to callers of `send`. Nothing here is retried.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No active session")]
    NoActiveSession,

    #[error("No transport attached")]
    NoTransport,

    #[error("Message could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Transport rejected message: {0}")]
    Rejected(String),
}

/// Best-effort fan-out of an encoded frame to every other participant
pub trait Transport: Send + Sync {
    fn publish(&self, frame: Vec<u8>) -> Result<(), TransportError>;
}
