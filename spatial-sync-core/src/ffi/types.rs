//! FFI types exposed via uniffi

use crate::license::{LicenseError, Tier};
use crate::messaging::TransportError;
use crate::network::NetworkError;
use crate::session::{JoinFailureReason, SessionState};
use crate::spatial::PresetRole;

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Already in a group")]
    AlreadyInGroup,

    #[error("Not in a group")]
    NotInGroup,

    #[error("Invalid group code: {0}")]
    InvalidGroupCode(String),

    #[error("Licence error: {0}")]
    License(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transform must have 16 elements, got {0}")]
    InvalidTransform(u32),
}

impl From<NetworkError> for CoreError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::AlreadyInGroup => CoreError::AlreadyInGroup,
            NetworkError::NotInGroup => CoreError::NotInGroup,
            other => CoreError::Network(other.to_string()),
        }
    }
}

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        CoreError::Send(e.to_string())
    }
}

impl From<LicenseError> for CoreError {
    fn from(e: LicenseError) -> Self {
        CoreError::License(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum SessionStatus {
    Idle,
    Pending,
    Active,
    Invalidated,
}

impl From<SessionState> for SessionStatus {
    fn from(s: SessionState) -> Self {
        match s {
            SessionState::Idle => SessionStatus::Idle,
            SessionState::Pending => SessionStatus::Pending,
            SessionState::Active => SessionStatus::Active,
            SessionState::Invalidated => SessionStatus::Invalidated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum LicenseTier {
    Free,
    Pro,
    Enterprise,
}

impl From<Tier> for LicenseTier {
    fn from(t: Tier) -> Self {
        match t {
            Tier::Free => LicenseTier::Free,
            Tier::Pro => LicenseTier::Pro,
            Tier::Enterprise => LicenseTier::Enterprise,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum JoinFailure {
    ParticipantLimitExceeded,
    SessionTimeLimitExceeded,
    ActivationRequired,
}

impl From<JoinFailureReason> for JoinFailure {
    fn from(r: JoinFailureReason) -> Self {
        match r {
            JoinFailureReason::ParticipantLimitExceeded => JoinFailure::ParticipantLimitExceeded,
            JoinFailureReason::SessionTimeLimitExceeded => JoinFailure::SessionTimeLimitExceeded,
            JoinFailureReason::ActivationRequired => JoinFailure::ActivationRequired,
        }
    }
}

/// Built-in placements for UI attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum PresetPlacement {
    ControlPanel,
    Notification,
    MediaControls,
    Toolbar,
}

impl From<PresetPlacement> for PresetRole {
    fn from(p: PresetPlacement) -> Self {
        match p {
            PresetPlacement::ControlPanel => PresetRole::ControlPanel,
            PresetPlacement::Notification => PresetRole::Notification,
            PresetPlacement::MediaControls => PresetRole::MediaControls,
            PresetPlacement::Toolbar => PresetRole::Toolbar,
        }
    }
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    fn on_ready(&self, session_id: String);
    fn on_hosted(&self, session_id: String);
    fn on_participant_joined(&self, participant_id: String);
    fn on_participant_left(&self, participant_id: String);
    /// The local participant was detached; the group carries on without us
    fn on_join_failed(&self, reason: JoinFailure);
    fn on_invalidated(&self, session_id: String);
    /// A message of a kind registered with `listen`
    fn on_message(&self, kind: String, sender: String, json: String);
    /// Playback suspended while another participant buffers
    fn on_playback_waiting(&self);
    fn on_playback_resumed(&self);
    fn on_rate_changed(&self, rate: f32);
}

/// The app's media player, driven by the coordinator
#[uniffi::export(callback_interface)]
pub trait NativePlayer: Send + Sync {
    fn has_content(&self) -> bool;
    fn rate(&self) -> f32;
    fn set_rate(&self, rate: f32);
    fn position_ms(&self) -> u64;
    fn seek_ms(&self, position_ms: u64);
}
