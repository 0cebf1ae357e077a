//! Spatial placement
//!
//! Positions UI and 3D content relative to the local device (solo) or the
//! local participant's seat (shared session).

mod math;
mod pose;
mod role;
mod subscription;
mod transform;

pub use math::{Mat4, Quat, Vec3};
pub use pose::SeatPose;
pub use role::{AttachmentRole, Placement, PresetRole};
pub use subscription::{AttachmentSubscriptions, TransformSubscription, TransformTarget};
pub use transform::{SpatialMode, SpatialSnapshot, TransformConfig, TransformEngine};
