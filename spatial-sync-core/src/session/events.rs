//! Session events
//!
//! Everything the engine reports about the session lifecycle arrives as one
//! of these variants on a single channel.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::participants::ParticipantId;

/// Why the local participant was detached from a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinFailureReason {
    ParticipantLimitExceeded,
    SessionTimeLimitExceeded,
    /// Defined for compatibility; nothing currently produces it
    ActivationRequired,
}

impl JoinFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinFailureReason::ParticipantLimitExceeded => "participant_limit_exceeded",
            JoinFailureReason::SessionTimeLimitExceeded => "session_time_limit_exceeded",
            JoinFailureReason::ActivationRequired => "activation_required",
        }
    }
}

/// Lifecycle events emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The coordinating layer signalled readiness; the session is active
    Ready { session_id: Uuid },
    /// The local participant hosts the new session
    Hosted { session_id: Uuid },
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
    /// The local participant was detached; other participants are unaffected
    JoinFailed { reason: JoinFailureReason },
    Invalidated { session_id: Uuid },
}
