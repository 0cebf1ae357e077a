//! Media player seam and delegate handlers

use std::fmt;
use std::sync::Arc;

/// The local media player. Only rate and position are coordinated; decoding
/// and rendering stay with the player.
pub trait MediaPlayer: Send + Sync {
    /// Whether content is loaded. Coordinating an empty player does nothing.
    fn has_content(&self) -> bool;
    fn rate(&self) -> f32;
    fn set_rate(&self, rate: f32);
    fn position_ms(&self) -> u64;
    fn seek_ms(&self, position_ms: u64);
}

/// Something the delegate should hear about
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackNotice {
    /// Local playback suspended while peers buffer
    Waiting,
    /// Suspension lifted
    BufferingComplete,
    /// A peer's play/pause changed the shared rate
    RateChanged(f32),
}

type Callback = Arc<dyn Fn() + Send + Sync>;
type RateCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Optional delegate callbacks; anything left unset is a no-op
#[derive(Clone, Default)]
pub struct PlaybackHandlers {
    on_waiting: Option<Callback>,
    on_buffering_complete: Option<Callback>,
    on_rate_changed: Option<RateCallback>,
}

impl PlaybackHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_waiting(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_waiting = Some(Arc::new(f));
        self
    }

    pub fn on_buffering_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_buffering_complete = Some(Arc::new(f));
        self
    }

    pub fn on_rate_changed(mut self, f: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.on_rate_changed = Some(Arc::new(f));
        self
    }

    pub fn notify(&self, notice: PlaybackNotice) {
        match notice {
            PlaybackNotice::Waiting => {
                if let Some(f) = &self.on_waiting {
                    f();
                }
            }
            PlaybackNotice::BufferingComplete => {
                if let Some(f) = &self.on_buffering_complete {
                    f();
                }
            }
            PlaybackNotice::RateChanged(rate) => {
                if let Some(f) = &self.on_rate_changed {
                    f(rate);
                }
            }
        }
    }
}

impl fmt::Debug for PlaybackHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackHandlers")
            .field("on_waiting", &self.on_waiting.is_some())
            .field("on_buffering_complete", &self.on_buffering_complete.is_some())
            .field("on_rate_changed", &self.on_rate_changed.is_some())
            .finish()
    }
}
