//! Playback Coordinator Adapter

mod coordinator;
mod player;
mod signal;

pub use coordinator::{
    PlaybackConfig, PlaybackCoordinator, Timeline, DEFAULT_DRIFT_THRESHOLD_MS,
    MAX_PLAYBACK_RATE,
};
pub use player::{MediaPlayer, PlaybackHandlers, PlaybackNotice};
pub use signal::{current_time_ms, PlaybackSignal};
