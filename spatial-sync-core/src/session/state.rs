//! Session State Machine
//!
//! `Idle → Pending → Active → Invalidated`. Transitions only move forward;
//! `Invalidated` is terminal and a new session needs a new handle.

use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use super::events::JoinFailureReason;
use super::participants::ParticipantId;

/// Lifecycle state of a [`SessionHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Idle,
    Pending,
    Active,
    Invalidated,
}

impl SessionState {
    /// Pending or active - a session exists and has not ended
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Pending | SessionState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Invalidated => "invalidated",
        }
    }
}

/// Opaque session reference delivered by the discovery feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSession {
    /// Identifier of the group activity (shared by every participant)
    pub id: String,
    pub host: ParticipantId,
    /// Our own identity within the session
    pub local: ParticipantId,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid session transition: {from:?} -> {to:?}")]
    Invalid {
        from: SessionState,
        to: SessionState,
    },
}

/// One group session as seen by this device
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    group_id: String,
    host: ParticipantId,
    local: ParticipantId,
    started_at: SystemTime,
    started: Instant,
    state: SessionState,
    history: Vec<SessionState>,
    detached: Option<JoinFailureReason>,
}

impl SessionHandle {
    /// New handle in `Idle`
    pub fn new(session: GroupSession) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: session.id,
            host: session.host,
            local: session.local,
            started_at: SystemTime::now(),
            started: Instant::now(),
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
            detached: None,
        }
    }

    /// Move forward to `next`
    pub fn transition(&mut self, next: SessionState) -> Result<(), TransitionError> {
        let allowed = matches!(
            (self.state, next),
            (SessionState::Idle, SessionState::Pending)
                | (SessionState::Pending, SessionState::Active)
                | (
                    SessionState::Idle | SessionState::Pending | SessionState::Active,
                    SessionState::Invalidated
                )
        );

        if !allowed {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: next,
            });
        }

        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Mark the local participant as detached. Returns false if already detached.
    pub fn detach(&mut self, reason: JoinFailureReason) -> bool {
        if self.detached.is_some() {
            return false;
        }
        self.detached = Some(reason);
        true
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn host(&self) -> &ParticipantId {
        &self.host
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn is_host(&self) -> bool {
        self.local == self.host
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state this handle has been in, oldest first
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn started_instant(&self) -> Instant {
        self.started
    }

    pub fn detached(&self) -> Option<JoinFailureReason> {
        self.detached
    }

    /// Active and not detached: shared features are in effect
    pub fn is_shared(&self) -> bool {
        self.state == SessionState::Active && self.detached.is_none()
    }
}
