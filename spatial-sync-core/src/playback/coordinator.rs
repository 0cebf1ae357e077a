//! Playback coordination
//!
//! Binds one local `MediaPlayer` to the group timeline. Rate signals from
//! peers move the timeline and re-seek on drift; buffering signals suspend
//! local playback until every stalled peer has recovered or left.
//!
//! Methods return the notices the delegate should hear. The caller fires them
//! through `PlaybackHandlers::notify` once its own locks are released.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::player::{MediaPlayer, PlaybackHandlers, PlaybackNotice};
use super::signal::PlaybackSignal;
use crate::session::ParticipantId;

/// Maximum position drift (in ms) before we re-sync the local player
pub const DEFAULT_DRIFT_THRESHOLD_MS: u64 = 3000;

/// Fastest rate a peer may ask for; anything above is treated as garbage
pub const MAX_PLAYBACK_RATE: f32 = 4.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub drift_threshold_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            drift_threshold_ms: DEFAULT_DRIFT_THRESHOLD_MS,
        }
    }
}

/// Last known shared timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeline {
    pub rate: f32,
    pub position_ms: u64,
    pub timestamp_ms: u64,
}

impl Timeline {
    /// Where the timeline should be at `now_ms`
    pub fn expected_position_ms(&self, now_ms: u64) -> u64 {
        if self.rate <= 0.0 {
            return self.position_ms;
        }
        let elapsed = now_ms.saturating_sub(self.timestamp_ms);
        // Float to int casts saturate
        let advanced = (elapsed as f64 * self.rate as f64) as u64;
        self.position_ms.saturating_add(advanced)
    }
}

struct Binding {
    player: Arc<dyn MediaPlayer>,
    handlers: PlaybackHandlers,
}

pub struct PlaybackCoordinator {
    config: PlaybackConfig,
    binding: Option<Binding>,
    timeline: Option<Timeline>,
    /// Peers currently buffering
    waiting_on: BTreeSet<ParticipantId>,
    /// Rate to restore when suspension lifts and no timeline is known
    resume_rate: f32,
}

impl PlaybackCoordinator {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            binding: None,
            timeline: None,
            waiting_on: BTreeSet::new(),
            resume_rate: 0.0,
        }
    }

    /// Bind a player, replacing any previous binding
    pub fn register(&mut self, player: Arc<dyn MediaPlayer>, handlers: PlaybackHandlers) {
        if !player.has_content() {
            warn!("Registering a player with no content; playback will not be coordinated until content loads");
        }
        if self.binding.is_some() {
            info!("Replacing previously registered player");
        }
        self.binding = Some(Binding { player, handlers });
    }

    pub fn unregister(&mut self) {
        self.binding = None;
    }

    pub fn is_registered(&self) -> bool {
        self.binding.is_some()
    }

    pub fn is_suspended(&self) -> bool {
        !self.waiting_on.is_empty()
    }

    pub fn waiting_on(&self) -> impl Iterator<Item = &ParticipantId> {
        self.waiting_on.iter()
    }

    pub fn timeline(&self) -> Option<Timeline> {
        self.timeline
    }

    /// Handlers of the current binding, for firing notices outside any lock
    pub fn handlers(&self) -> PlaybackHandlers {
        self.binding
            .as_ref()
            .map(|b| b.handlers.clone())
            .unwrap_or_default()
    }

    /// Player with content, if any
    fn active_player(&self) -> Option<&Arc<dyn MediaPlayer>> {
        self.binding
            .as_ref()
            .map(|b| &b.player)
            .filter(|p| p.has_content())
    }

    pub fn handle_signal(
        &mut self,
        from: &ParticipantId,
        signal: &PlaybackSignal,
        now_ms: u64,
    ) -> Vec<PlaybackNotice> {
        match signal {
            PlaybackSignal::Rate {
                rate,
                position_ms,
                timestamp_ms,
            } => self.apply_rate(
                from,
                Timeline {
                    rate: *rate,
                    position_ms: *position_ms,
                    timestamp_ms: *timestamp_ms,
                },
                now_ms,
            ),
            PlaybackSignal::BufferingStarted => self.peer_stalled(from),
            PlaybackSignal::BufferingFinished => self.peer_recovered(from),
        }
    }

    fn apply_rate(&mut self, from: &ParticipantId, timeline: Timeline, now_ms: u64) -> Vec<PlaybackNotice> {
        if !timeline.rate.is_finite() || !(0.0..=MAX_PLAYBACK_RATE).contains(&timeline.rate) {
            warn!("Ignoring rate {} from {}", timeline.rate, from);
            return Vec::new();
        }

        let mut notices = Vec::new();
        let rate_changed = self.timeline.map(|t| t.rate != timeline.rate).unwrap_or(true);
        self.timeline = Some(timeline);

        if rate_changed {
            info!("Rate {} from {}", timeline.rate, from);
            notices.push(PlaybackNotice::RateChanged(timeline.rate));
        }

        let Some(player) = self.active_player() else {
            debug!("Rate signal from {} with nothing to coordinate", from);
            return notices;
        };

        if self.is_suspended() {
            // Applied when the suspension lifts
            return notices;
        }

        let expected = timeline.expected_position_ms(now_ms);
        let current = player.position_ms();
        let drift = current.abs_diff(expected);
        debug!(
            "Sync: drift {}ms {} (expected: {}ms, actual: {}ms)",
            drift,
            if current >= expected { "ahead" } else { "behind" },
            expected,
            current
        );

        if drift > self.config.drift_threshold_ms {
            info!(
                "Position drift {}ms exceeds threshold, re-syncing (target: {}ms, current: {}ms)",
                drift, expected, current
            );
            player.seek_ms(expected);
        }

        if player.rate() != timeline.rate {
            player.set_rate(timeline.rate);
        }
        notices
    }

    fn peer_stalled(&mut self, from: &ParticipantId) -> Vec<PlaybackNotice> {
        let was_suspended = self.is_suspended();
        if !self.waiting_on.insert(from.clone()) || was_suspended {
            return Vec::new();
        }

        info!("{} is buffering, suspending playback", from);
        if let Some(player) = self.active_player().cloned() {
            self.resume_rate = player.rate();
            player.set_rate(0.0);
        }
        vec![PlaybackNotice::Waiting]
    }

    fn peer_recovered(&mut self, from: &ParticipantId) -> Vec<PlaybackNotice> {
        if !self.waiting_on.remove(from) || self.is_suspended() {
            return Vec::new();
        }
        self.resume()
    }

    /// A participant left; stop waiting for them
    pub fn peer_left(&mut self, id: &ParticipantId) -> Vec<PlaybackNotice> {
        self.peer_recovered(id)
    }

    fn resume(&mut self) -> Vec<PlaybackNotice> {
        let rate = self.timeline.map(|t| t.rate).unwrap_or(self.resume_rate);
        info!("Buffering complete, resuming at rate {}", rate);
        if let Some(player) = self.active_player() {
            player.set_rate(rate);
        }
        vec![PlaybackNotice::BufferingComplete]
    }

    /// Session ended: forget the shared timeline and lift any suspension
    pub fn reset(&mut self) -> Vec<PlaybackNotice> {
        self.timeline = None;
        if self.waiting_on.is_empty() {
            return Vec::new();
        }
        self.waiting_on.clear();
        self.resume()
    }

    /// Local play/pause. Returns the signal to broadcast, if a player is bound.
    pub fn set_local_rate(&mut self, rate: f32, now_ms: u64) -> Option<PlaybackSignal> {
        let Some(binding) = self.binding.as_ref() else {
            warn!("No player registered, ignoring rate change");
            return None;
        };

        binding.player.set_rate(rate);
        let position_ms = binding.player.position_ms();
        self.timeline = Some(Timeline {
            rate,
            position_ms,
            timestamp_ms: now_ms,
        });
        Some(PlaybackSignal::Rate {
            rate,
            position_ms,
            timestamp_ms: now_ms,
        })
    }

    /// Current local timeline as a heartbeat, if a player with content is bound
    ///
    /// Nothing is sent while suspended: the local rate is 0 only because a
    /// peer is buffering, and peers would take it for a pause.
    pub fn heartbeat(&self, now_ms: u64) -> Option<PlaybackSignal> {
        if self.is_suspended() {
            debug!("Suspended, skipping heartbeat");
            return None;
        }
        let player = self.active_player()?;
        Some(PlaybackSignal::Rate {
            rate: player.rate(),
            position_ms: player.position_ms(),
            timestamp_ms: now_ms,
        })
    }

    /// Local seek. Never broadcast; while shared the player diverges until the
    /// next rate signal pulls it back.
    pub fn seek_local(&mut self, position_ms: u64, shared: bool) {
        let Some(binding) = self.binding.as_ref() else {
            warn!("No player registered, ignoring seek");
            return;
        };
        if shared {
            warn!(
                "Seeking to {}ms during a shared session; other participants are not moved",
                position_ms
            );
        }
        binding.player.seek_ms(position_ms);
    }
}

impl Default for PlaybackCoordinator {
    fn default() -> Self {
        Self::new(PlaybackConfig::default())
    }
}
