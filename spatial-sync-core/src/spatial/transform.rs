//! Spatial Transform Engine
//!
//! Resolves an [`AttachmentRole`] to a world transform. Which reference frame
//! is used depends on whether a shared session is live:
//!
//! - solo: fixed device-relative origin, depth axis inverted
//! - shared, no seat pose yet: static fallback seat common to all participants
//! - shared with seat pose: `pose × local offset`

use serde::{Deserialize, Serialize};

use super::math::{Mat4, Quat, Vec3};
use super::role::AttachmentRole;

/// Transform engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Reference frame used when no session is active
    pub device_origin: Mat4,
    /// Seat used in a shared session when no dynamic pose has arrived
    pub fallback_seat: Mat4,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            device_origin: Mat4::IDENTITY,
            fallback_seat: Mat4::from_translation(Vec3::new(0.0, 0.0, -1.2)),
        }
    }
}

/// Which reference frame transforms resolve against
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpatialMode {
    Solo,
    Shared { seat: Option<Mat4> },
}

/// Everything a transform depends on, published by the engine on each change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialSnapshot {
    pub mode: SpatialMode,
    /// False while a session is pending: positioning data does not exist yet
    pub ready: bool,
}

impl SpatialSnapshot {
    pub fn solo() -> Self {
        Self {
            mode: SpatialMode::Solo,
            ready: true,
        }
    }

    pub fn pending() -> Self {
        Self {
            mode: SpatialMode::Solo,
            ready: false,
        }
    }

    pub fn shared(seat: Option<Mat4>) -> Self {
        Self {
            mode: SpatialMode::Shared { seat },
            ready: true,
        }
    }
}

/// Pure transform computation
#[derive(Debug, Clone, Default)]
pub struct TransformEngine {
    config: TransformConfig,
}

impl TransformEngine {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Resolve a role against a snapshot. Never blocks, no side effects.
    pub fn compute(&self, snapshot: &SpatialSnapshot, role: &AttachmentRole) -> Mat4 {
        let (position, rotation) = role.local_offset();
        let rotation = rotation.unwrap_or(Quat::IDENTITY);

        match snapshot.mode {
            SpatialMode::Solo => {
                // In front of the viewer relative to device facing
                let local = Mat4::from_rotation_translation(rotation, position.with_depth_inverted());
                self.config.device_origin * local
            }
            SpatialMode::Shared { seat } => {
                let local = Mat4::from_rotation_translation(rotation, position);
                let seat = seat.unwrap_or(self.config.fallback_seat);
                seat * local
            }
        }
    }
}
