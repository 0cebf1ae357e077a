//! Spatial Sync - Core Library
//!
//! Keeps a group of participants in one shared session: synchronized
//! playback, shared placement of UI attachments and app-defined messages,
//! carried peer-to-peer over libp2p.

pub mod engine;
pub mod ffi;
pub mod license;
pub mod messaging;
pub mod network;
pub mod playback;
pub mod session;
pub mod spatial;

// Re-exports for convenience
pub use engine::{EngineConfig, SyncEngine};
pub use license::{LicenseGate, Tier};
pub use messaging::{GroupMessage, ListenerToken, Received, Transport, TransportError};
pub use playback::{MediaPlayer, PlaybackHandlers};
pub use session::{GroupSession, JoinFailureReason, ParticipantId, SessionEvent, SessionState};
pub use spatial::{AttachmentRole, Mat4, SeatPose, TransformSubscription, TransformTarget};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
