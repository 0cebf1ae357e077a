//! Attachment roles - where a piece of UI or 3D content should sit

use serde::{Deserialize, Serialize};

use super::math::{Quat, Vec3};

/// Named placements with a predefined offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetRole {
    ControlPanel,
    Notification,
    MediaControls,
    Toolbar,
}

impl PresetRole {
    /// Offset table, declared in the seat-relative convention (+z in front of the seat)
    pub fn offset(self) -> (Vec3, Option<Quat>) {
        match self {
            PresetRole::ControlPanel => (Vec3::new(0.0, -0.35, 0.6), None),
            PresetRole::Notification => (Vec3::new(0.0, 0.3, 0.8), None),
            PresetRole::MediaControls => (Vec3::new(0.0, -0.5, 0.7), None),
            PresetRole::Toolbar => (
                Vec3::new(-0.45, -0.2, 0.55),
                Some(Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), 0.35)),
            ),
        }
    }
}

/// What kind of placement a role asks for
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Preset(PresetRole),
    Custom {
        position: Vec3,
        #[serde(default)]
        rotation: Option<Quat>,
    },
}

/// A named placement request. Value type: the same role always resolves to the
/// same transform for the same seat pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRole {
    pub id: String,
    pub placement: Placement,
}

impl AttachmentRole {
    pub fn preset(id: impl Into<String>, preset: PresetRole) -> Self {
        Self {
            id: id.into(),
            placement: Placement::Preset(preset),
        }
    }

    pub fn custom(id: impl Into<String>, position: Vec3, rotation: Option<Quat>) -> Self {
        Self {
            id: id.into(),
            placement: Placement::Custom { position, rotation },
        }
    }

    /// Declared local offset (position + optional rotation)
    pub fn local_offset(&self) -> (Vec3, Option<Quat>) {
        match self.placement {
            Placement::Preset(preset) => preset.offset(),
            Placement::Custom { position, rotation } => (position, rotation),
        }
    }
}
