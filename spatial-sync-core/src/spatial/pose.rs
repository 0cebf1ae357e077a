//! Seat poses produced by the external spatial coordinator

use serde::{Deserialize, Serialize};

use super::math::Mat4;
use crate::session::ParticipantId;

/// A participant's dynamic anchor in shared space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatPose {
    pub participant: ParticipantId,
    pub transform: Mat4,
}

impl SeatPose {
    pub fn new(participant: ParticipantId, transform: Mat4) -> Self {
        Self {
            participant,
            transform,
        }
    }
}
