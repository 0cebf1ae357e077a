//! Wire envelope for group messages

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::session::ParticipantId;

/// An application-defined message type that can travel over the bus
///
/// `KIND` identifies the type on the wire and must be identical on every
/// participant; listeners only fire for their exact kind.
pub trait GroupMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;
}

/// What actually crosses the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    /// Filled in by the sending device. Not authenticated.
    pub sender: ParticipantId,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn wrap<T: GroupMessage>(sender: ParticipantId, message: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: T::KIND.to_string(),
            sender,
            payload: serde_json::to_value(message)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

/// A decoded message handed to listeners
///
/// `sender` is whatever the sending device claimed. Never use it as proof of
/// identity for privileged decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct Received<T> {
    pub sender: ParticipantId,
    pub message: T,
}
