//! Playback signals exchanged between participants

use serde::{Deserialize, Serialize};

use crate::messaging::GroupMessage;

/// Coordination traffic carried on the message bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaybackSignal {
    /// Shared timeline: `rate` from `position_ms` as of `timestamp_ms`.
    /// Sent on play/pause and periodically as a heartbeat.
    Rate {
        rate: f32,
        position_ms: u64,
        timestamp_ms: u64,
    },
    /// The sender stalled and wants everyone to wait
    BufferingStarted,
    BufferingFinished,
}

impl GroupMessage for PlaybackSignal {
    const KIND: &'static str = "spatial-sync.playback";
}

/// Get current time in milliseconds since UNIX epoch
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
