//! Sync engine
//!
//! Wires the session state machine, roster, playback coordinator, transform
//! engine, message bus and licence gate together behind one cloneable handle.
//!
//! Lock order is `core` then `playback`. Delegate callbacks and bus handlers
//! are always invoked with no engine lock held.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::license::{LicenseConfig, LicenseError, LicenseGate, LicenseState, Tier};
use crate::messaging::{
    BusConfig, Envelope, GroupMessage, ListenerToken, MessageBus, Received, Transport,
    TransportError,
};
use crate::playback::{
    current_time_ms, MediaPlayer, PlaybackConfig, PlaybackCoordinator, PlaybackHandlers,
    PlaybackNotice, PlaybackSignal,
};
use crate::session::{
    GroupSession, JoinFailureReason, ParticipantId, ParticipantRegistry, ParticipantSet,
    SessionEvent, SessionHandle, SessionState,
};
use crate::spatial::{
    AttachmentRole, AttachmentSubscriptions, Mat4, SeatPose, SpatialSnapshot, TransformConfig,
    TransformEngine, TransformSubscription, TransformTarget,
};

/// Engine configuration. Every section has defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub license: LicenseConfig,
    pub transforms: TransformConfig,
    pub bus: BusConfig,
    pub playback: PlaybackConfig,
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Session-scoped state guarded by one lock
#[derive(Default)]
struct SessionCore {
    handle: Option<SessionHandle>,
    registry: ParticipantRegistry,
    seat_poses: HashMap<ParticipantId, Mat4>,
    watchdog: Option<JoinHandle<()>>,
}

impl SessionCore {
    fn live_handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref().filter(|h| h.state().is_live())
    }

    fn snapshot(&self) -> SpatialSnapshot {
        match &self.handle {
            Some(h) if h.is_shared() => {
                SpatialSnapshot::shared(self.seat_poses.get(h.local()).copied())
            }
            Some(h) if h.state() == SessionState::Pending && h.detached().is_none() => {
                SpatialSnapshot::pending()
            }
            _ => SpatialSnapshot::solo(),
        }
    }

    fn stop_watchdog(&mut self) {
        if let Some(task) = self.watchdog.take() {
            task.abort();
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    license: LicenseGate,
    bus: MessageBus,
    transforms: TransformEngine,
    core: Mutex<SessionCore>,
    playback: Mutex<PlaybackCoordinator>,
    spatial_tx: watch::Sender<SpatialSnapshot>,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Where background tasks go when the caller is not on a runtime thread
    runtime: Option<Handle>,
}

/// Handle to the engine. Clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine and the receiver for its session events
    ///
    /// Background tasks run on the ambient tokio runtime, if there is one.
    pub fn new(config: EngineConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::build(config, Handle::try_current().ok())
    }

    /// Like [`SyncEngine::new`], for callers driving the engine from threads
    /// outside `runtime`
    pub fn with_runtime(
        config: EngineConfig,
        runtime: Handle,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::build(config, Some(runtime))
    }

    fn build(
        config: EngineConfig,
        runtime: Option<Handle>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (spatial_tx, _) = watch::channel(SpatialSnapshot::solo());

        let inner = Arc::new(EngineInner {
            license: LicenseGate::new(config.license.clone()),
            bus: MessageBus::new(config.bus.clone()),
            transforms: TransformEngine::new(config.transforms.clone()),
            core: Mutex::new(SessionCore::default()),
            playback: Mutex::new(PlaybackCoordinator::new(config.playback.clone())),
            spatial_tx,
            events,
            runtime,
            config,
        });

        let engine = Self { inner };
        engine.listen_for_playback();
        (engine, event_rx)
    }

    fn from_weak(weak: &Weak<EngineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn listen_for_playback(&self) {
        let weak = Arc::downgrade(&self.inner);
        // Lives as long as the bus, which the engine owns
        let _token = self.inner.bus.listen(move |r: Received<PlaybackSignal>| {
            if let Some(engine) = Self::from_weak(&weak) {
                engine.on_playback_signal(r);
            }
        });
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("Session event dropped: receiver closed");
        }
    }

    fn publish_spatial(&self, core: &SessionCore) {
        let next = core.snapshot();
        self.inner.spatial_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn notify_playback(&self, notices: Vec<PlaybackNotice>) {
        if notices.is_empty() {
            return;
        }
        let handlers = self.inner.playback.lock().handlers();
        for notice in notices {
            handlers.notify(notice);
        }
    }

    // ========== Licence ==========

    /// Verify a licence key. Must run before the first session is set up.
    pub fn activate(&self, key: Option<&str>) -> Result<Tier, LicenseError> {
        self.inner.license.activate(key)
    }

    pub fn tier(&self) -> Tier {
        self.inner.license.tier()
    }

    pub fn license(&self) -> &LicenseState {
        self.inner.license.state()
    }

    /// Detach the local participant if the session outlived the tier limit
    pub fn enforce_time_limit(&self) {
        let mut core = self.inner.core.lock();
        let Some(handle) = core.handle.as_ref() else {
            return;
        };
        if handle.state() != SessionState::Active {
            return;
        }
        if let Err(reason) = self.inner.license.check_duration(handle.elapsed()) {
            self.detach_locked(&mut core, reason);
        }
    }

    fn detach_locked(&self, core: &mut SessionCore, reason: JoinFailureReason) {
        let Some(handle) = core.handle.as_mut() else {
            return;
        };
        if !handle.detach(reason) {
            return;
        }

        warn!(
            "Detached from session {} ({}); other participants continue",
            handle.id(),
            reason.as_str()
        );
        self.emit(SessionEvent::JoinFailed { reason });
        self.publish_spatial(core);
    }

    fn arm_watchdog(&self, core: &mut SessionCore) {
        let Some(max) = self.inner.license.tier().limits().max_duration else {
            return;
        };
        let Some(handle) = core.handle.as_ref() else {
            return;
        };
        let runtime = match self.inner.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(rt) => rt,
            None => {
                warn!("No async runtime, session duration is only checked by enforce_time_limit");
                return;
            }
        };

        let deadline = handle.started_instant() + max;
        let weak = Arc::downgrade(&self.inner);
        core.stop_watchdog();
        core.watchdog = Some(runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(engine) = Self::from_weak(&weak) {
                engine.enforce_time_limit();
            }
        }));
        debug!("Session duration limit armed: {:?}", max);
    }

    #[cfg(test)]
    pub(crate) fn has_time_limit_armed(&self) -> bool {
        self.inner.core.lock().watchdog.is_some()
    }

    // ========== Session lifecycle ==========

    /// Start tracking a newly discovered group session
    ///
    /// A still-live previous session is invalidated first.
    pub fn setup_session(&self, session: GroupSession) -> Uuid {
        // Fix the tier before any session state exists
        let tier = self.inner.license.tier();

        let mut notices = Vec::new();
        let id = {
            let mut core = self.inner.core.lock();
            if core.live_handle().is_some() {
                info!("New session discovered, invalidating the current one");
                notices = self.invalidate_locked(&mut core);
            }

            let mut handle = SessionHandle::new(session);
            if let Err(e) = handle.transition(SessionState::Pending) {
                warn!("Fresh session handle refused to start: {}", e);
            }
            let id = handle.id();
            let hosted = handle.is_host();

            info!(
                "Session {} set up for group '{}' (host: {}, tier: {})",
                id,
                handle.group_id(),
                handle.host(),
                tier.as_str()
            );

            core.registry.reset();
            core.seat_poses.clear();
            core.stop_watchdog();
            core.handle = Some(handle);

            if hosted {
                self.emit(SessionEvent::Hosted { session_id: id });
            }
            self.publish_spatial(&core);
            id
        };

        self.notify_playback(notices);
        id
    }

    /// The coordinating layer is ready: `Pending → Active`
    pub fn mark_ready(&self) {
        let mut core = self.inner.core.lock();
        let Some(handle) = core.handle.as_mut() else {
            warn!("mark_ready called without a session");
            return;
        };
        if let Err(e) = handle.transition(SessionState::Active) {
            warn!("mark_ready ignored: {}", e);
            return;
        }

        let id = handle.id();
        info!("Session {} is active", id);
        self.emit(SessionEvent::Ready { session_id: id });
        self.publish_spatial(&core);
        self.arm_watchdog(&mut core);
    }

    /// Report a change of the underlying session. Only invalidation matters.
    pub fn handle_session_state_change(&self, is_invalidated: bool) {
        if !is_invalidated {
            debug!("Session state change without invalidation, ignoring");
            return;
        }

        let notices = {
            let mut core = self.inner.core.lock();
            self.invalidate_locked(&mut core)
        };
        self.notify_playback(notices);
    }

    fn invalidate_locked(&self, core: &mut SessionCore) -> Vec<PlaybackNotice> {
        let Some(handle) = core.handle.as_mut() else {
            return Vec::new();
        };
        if handle.transition(SessionState::Invalidated).is_err() {
            // Already invalidated
            return Vec::new();
        }

        let id = handle.id();
        info!("Session {} invalidated", id);
        self.emit(SessionEvent::Invalidated { session_id: id });

        core.registry.clear();
        core.seat_poses.clear();
        core.stop_watchdog();
        self.publish_spatial(core);
        self.inner.playback.lock().reset()
    }

    pub fn session_state(&self) -> SessionState {
        self.inner
            .core
            .lock()
            .handle
            .as_ref()
            .map(|h| h.state())
            .unwrap_or(SessionState::Idle)
    }

    /// Snapshot of the current session handle
    pub fn current_session(&self) -> Option<SessionHandle> {
        self.inner.core.lock().handle.clone()
    }

    /// Shared features (placement, messages, playback) are in effect
    pub fn share_play_enabled(&self) -> bool {
        self.inner
            .core
            .lock()
            .handle
            .as_ref()
            .map(|h| h.is_shared())
            .unwrap_or(false)
    }

    pub fn local_participant(&self) -> Option<ParticipantId> {
        self.inner.core.lock().handle.as_ref().map(|h| h.local().clone())
    }

    pub fn is_host(&self) -> bool {
        self.inner
            .core
            .lock()
            .live_handle()
            .map(|h| h.is_host())
            .unwrap_or(false)
    }

    // ========== Participants ==========

    /// Replace the roster with a full snapshot from the session
    pub fn update_participants<I>(&self, ids: I)
    where
        I: IntoIterator<Item = ParticipantId>,
    {
        let snapshot: ParticipantSet = ids.into_iter().collect();

        let notices = {
            let mut core = self.inner.core.lock();
            if core.live_handle().is_none() {
                debug!("Roster update without a live session, ignoring");
                return;
            }

            let diff = core.registry.apply(snapshot);
            for id in &diff.joined {
                info!("Participant joined: {}", id);
                self.emit(SessionEvent::ParticipantJoined(id.clone()));
            }
            let mut notices = Vec::new();
            for id in &diff.left {
                info!("Participant left: {}", id);
                self.emit(SessionEvent::ParticipantLeft(id.clone()));
                core.seat_poses.remove(id);
                notices.extend(self.inner.playback.lock().peer_left(id));
            }

            let count = core.registry.current().len();
            if let Err(reason) = self.inner.license.check_participants(count) {
                self.detach_locked(&mut core, reason);
            }
            self.publish_spatial(&core);
            notices
        };

        self.notify_playback(notices);
    }

    pub fn participants(&self) -> ParticipantSet {
        self.inner.core.lock().registry.current().clone()
    }

    pub fn peak_participants(&self) -> usize {
        self.inner.core.lock().registry.peak()
    }

    // ========== Spatial ==========

    /// Seat-pose feed entry point
    pub fn update_seat_pose(&self, pose: SeatPose) {
        let mut core = self.inner.core.lock();
        if core.live_handle().is_none() {
            debug!("Seat pose for {} without a live session, ignoring", pose.participant);
            return;
        }
        core.seat_poses.insert(pose.participant, pose.transform);
        self.publish_spatial(&core);
    }

    pub fn spatial_snapshot(&self) -> SpatialSnapshot {
        *self.inner.spatial_tx.borrow()
    }

    /// Current transform for `role`. Never waits.
    pub fn get_transform(&self, role: &AttachmentRole) -> Mat4 {
        let snapshot = self.spatial_snapshot();
        self.inner.transforms.compute(&snapshot, role)
    }

    /// Keep `target` positioned for `role` until the handle is dropped or
    /// cancelled, or the target itself is dropped. Needs a tokio runtime.
    pub fn subscribe_to_transform_updates<T: TransformTarget>(
        &self,
        target: &Arc<T>,
        role: AttachmentRole,
    ) -> TransformSubscription {
        let weak = Arc::downgrade(target);
        let weak: Weak<dyn TransformTarget> = weak;
        self.subscribe_weak(weak, role)
    }

    fn subscribe_weak(
        &self,
        target: Weak<dyn TransformTarget>,
        role: AttachmentRole,
    ) -> TransformSubscription {
        debug!("Subscribing transform updates for role '{}'", role.id);
        TransformSubscription::spawn(
            target,
            role,
            self.inner.transforms.clone(),
            self.inner.spatial_tx.subscribe(),
        )
    }

    /// Subscribe every role that has a matching attachment
    pub fn handle_attachment_updates(
        &self,
        attachments: &HashMap<String, Arc<dyn TransformTarget>>,
        roles: &[AttachmentRole],
    ) -> AttachmentSubscriptions {
        let mut subscriptions = AttachmentSubscriptions::default();
        for role in roles {
            match attachments.get(&role.id) {
                Some(target) => {
                    subscriptions.push(self.subscribe_weak(Arc::downgrade(target), role.clone()))
                }
                None => debug!("No attachment for role '{}', skipping", role.id),
            }
        }
        subscriptions
    }

    // ========== Messaging ==========

    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        self.inner.bus.set_transport(transport);
    }

    pub fn detach_transport(&self) {
        self.inner.bus.clear_transport();
    }

    /// Sender id for outbound traffic, if sharing is in effect
    fn shared_sender(&self) -> Result<ParticipantId, TransportError> {
        self.inner
            .core
            .lock()
            .handle
            .as_ref()
            .filter(|h| h.is_shared())
            .map(|h| h.local().clone())
            .ok_or(TransportError::NoActiveSession)
    }

    /// Send a message to every other participant
    pub async fn send<T: GroupMessage>(&self, message: &T) -> Result<(), TransportError> {
        let sender = self.shared_sender()?;
        self.inner.bus.send_as(&sender, message)
    }

    /// Untyped send for callers that only have JSON
    pub fn send_raw(&self, kind: &str, payload: serde_json::Value) -> Result<(), TransportError> {
        let sender = self.shared_sender()?;
        self.inner.bus.send_envelope(&Envelope {
            kind: kind.to_string(),
            sender,
            payload,
        })
    }

    pub fn listen<T, F>(&self, handler: F) -> ListenerToken
    where
        T: GroupMessage,
        F: Fn(Received<T>) + Send + Sync + 'static,
    {
        self.inner.bus.listen(handler)
    }

    pub fn listen_raw<F>(&self, kind: &str, handler: F) -> ListenerToken
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.bus.listen_raw(kind, handler)
    }

    pub fn remove_listener(&self, token: &ListenerToken) -> bool {
        self.inner.bus.remove_listener(token)
    }

    /// Hand an inbound frame to the bus. Returns the number of handlers invoked.
    pub fn deliver(&self, frame: &[u8]) -> usize {
        let accepting = self
            .inner
            .core
            .lock()
            .live_handle()
            .map(|h| h.detached().is_none())
            .unwrap_or(false);
        if !accepting {
            debug!("Inbound frame ({} bytes) outside a session, dropping", frame.len());
            return 0;
        }
        self.inner.bus.deliver(frame)
    }

    // ========== Playback ==========

    /// Bind the local player, replacing any earlier one
    pub fn register_player(&self, player: Arc<dyn MediaPlayer>, handlers: PlaybackHandlers) {
        self.inner.playback.lock().register(player, handlers);
    }

    pub fn unregister_player(&self) {
        self.inner.playback.lock().unregister();
    }

    pub fn play(&self) {
        self.set_rate(1.0);
    }

    pub fn pause(&self) {
        self.set_rate(0.0);
    }

    fn set_rate(&self, rate: f32) {
        let signal = self.inner.playback.lock().set_local_rate(rate, current_time_ms());
        if let Some(signal) = signal {
            self.broadcast_playback(&signal);
        }
    }

    /// Local player stalled or recovered
    pub fn set_buffering(&self, buffering: bool) {
        let signal = if buffering {
            PlaybackSignal::BufferingStarted
        } else {
            PlaybackSignal::BufferingFinished
        };
        self.broadcast_playback(&signal);
    }

    /// Seek the local player only
    pub fn seek(&self, position_ms: u64) {
        let shared = self.share_play_enabled();
        self.inner.playback.lock().seek_local(position_ms, shared);
    }

    /// Broadcast the local timeline so late joiners and drifting peers catch up
    pub fn send_heartbeat(&self) {
        let signal = self.inner.playback.lock().heartbeat(current_time_ms());
        if let Some(signal) = signal {
            self.broadcast_playback(&signal);
        }
    }

    fn broadcast_playback(&self, signal: &PlaybackSignal) {
        let sender = match self.shared_sender() {
            Ok(sender) => sender,
            Err(_) => {
                debug!("Playback signal not broadcast: no shared session");
                return;
            }
        };
        if let Err(e) = self.inner.bus.send_as(&sender, signal) {
            warn!("Failed to broadcast playback signal: {}", e);
        }
    }

    fn on_playback_signal(&self, received: Received<PlaybackSignal>) {
        match self.shared_sender() {
            Ok(local) if local == received.sender => return,
            Ok(_) => {}
            Err(_) => {
                debug!("Playback signal from {} outside a shared session", received.sender);
                return;
            }
        }

        let notices = self.inner.playback.lock().handle_signal(
            &received.sender,
            &received.message,
            current_time_ms(),
        );
        self.notify_playback(notices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::{encode_vendor_key, issue_key, LicensePayload};
    use crate::spatial::{PresetRole, Vec3};
    use libp2p::identity::Keypair;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const BUNDLE: &str = "com.example.theater";

    fn group(host: &str, local: &str) -> GroupSession {
        GroupSession {
            id: "movie-night".into(),
            host: ParticipantId::from(host),
            local: ParticipantId::from(local),
        }
    }

    fn ids(names: &[&str]) -> Vec<ParticipantId> {
        names.iter().map(|n| ParticipantId::from(*n)).collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn pro_engine() -> (SyncEngine, mpsc::UnboundedReceiver<SessionEvent>) {
        let vendor = Keypair::generate_ed25519();
        let config = EngineConfig {
            license: LicenseConfig {
                bundle_id: BUNDLE.into(),
                vendor_public_key: Some(encode_vendor_key(&vendor.public())),
            },
            ..Default::default()
        };
        let key = issue_key(
            &vendor,
            &LicensePayload {
                bundle_id: BUNDLE.into(),
                tier: Tier::Pro,
                expires_at: None,
            },
        )
        .unwrap();

        let (engine, rx) = SyncEngine::new(config);
        assert_eq!(engine.activate(Some(&key)).unwrap(), Tier::Pro);
        (engine, rx)
    }

    /// Frames published by one engine land on another
    struct Loopback {
        peer: SyncEngine,
    }

    impl Transport for Loopback {
        fn publish(&self, frame: Vec<u8>) -> Result<(), TransportError> {
            self.peer.deliver(&frame);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<Mat4>>,
    }

    impl TransformTarget for Recorder {
        fn apply_transform(&self, transform: Mat4) {
            self.applied.lock().push(transform);
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    impl GroupMessage for Chat {
        const KIND: &'static str = "test.chat";
    }

    #[test]
    fn test_config_from_json_fills_defaults() {
        let config =
            EngineConfig::from_json(r#"{ "bus": { "max_payload_bytes": 1024 } }"#).unwrap();
        assert_eq!(config.bus.max_payload_bytes, 1024);
        assert_eq!(config.playback, PlaybackConfig::default());
        assert_eq!(config.transforms, TransformConfig::default());

        assert!(EngineConfig::from_json("{ not json").is_err());
    }

    #[test]
    fn test_session_lifecycle_events() {
        let (engine, mut events) = SyncEngine::new(EngineConfig::default());
        assert_eq!(engine.session_state(), SessionState::Idle);

        let id = engine.setup_session(group("alice", "alice"));
        assert_eq!(engine.session_state(), SessionState::Pending);
        assert!(!engine.share_play_enabled());

        engine.mark_ready();
        assert!(engine.share_play_enabled());

        engine.handle_session_state_change(true);
        engine.handle_session_state_change(true);
        assert_eq!(engine.session_state(), SessionState::Invalidated);

        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::Hosted { session_id: id },
                SessionEvent::Ready { session_id: id },
                SessionEvent::Invalidated { session_id: id },
            ]
        );
        assert_eq!(
            engine.current_session().unwrap().history(),
            &[
                SessionState::Idle,
                SessionState::Pending,
                SessionState::Active,
                SessionState::Invalidated
            ]
        );
    }

    #[test]
    fn test_mark_ready_without_pending_session_is_ignored() {
        let (engine, mut events) = SyncEngine::new(EngineConfig::default());
        engine.mark_ready();
        assert!(drain(&mut events).is_empty());

        engine.setup_session(group("host", "me"));
        engine.mark_ready();
        engine.mark_ready();
        assert_eq!(drain(&mut events).len(), 1);
    }

    #[test]
    fn test_new_session_invalidates_live_one_first() {
        let (engine, mut events) = SyncEngine::new(EngineConfig::default());
        let first = engine.setup_session(group("host", "me"));
        engine.mark_ready();
        engine.update_participants(ids(&["host", "me"]));
        drain(&mut events);

        let second = engine.setup_session(group("host", "me"));
        assert_ne!(first, second);
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::Invalidated { session_id: first }]
        );
        assert!(engine.participants().is_empty());
        assert_eq!(engine.peak_participants(), 0);
        assert_eq!(engine.session_state(), SessionState::Pending);
    }

    #[test]
    fn test_invalidation_clears_roster_and_next_session_starts_fresh() {
        let (engine, mut events) = SyncEngine::new(EngineConfig::default());
        let first = engine.setup_session(group("host", "me"));
        engine.mark_ready();
        engine.update_participants(ids(&["host", "me"]));
        assert_eq!(engine.participants().len(), 2);
        drain(&mut events);

        engine.handle_session_state_change(true);
        assert_eq!(engine.session_state(), SessionState::Invalidated);
        assert!(engine.participants().is_empty());
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::Invalidated { session_id: first }]
        );

        let second = engine.setup_session(group("host", "me"));
        assert_ne!(first, second);
        assert!(drain(&mut events).is_empty());
        let handle = engine.current_session().unwrap();
        assert_eq!(handle.id(), second);
        assert_eq!(handle.history(), &[SessionState::Idle, SessionState::Pending]);
        assert!(engine.participants().is_empty());
    }

    #[test]
    fn test_time_limit_armed_on_stored_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        let (engine, mut events) =
            SyncEngine::with_runtime(EngineConfig::default(), runtime.handle().clone());

        // Called from a plain thread, not from inside the runtime
        engine.setup_session(group("a", "a"));
        engine.mark_ready();
        assert!(engine.has_time_limit_armed());
        drain(&mut events);

        runtime.block_on(async {
            tokio::time::sleep(Duration::from_secs(16 * 60)).await;
            settle().await;
        });
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::JoinFailed {
                reason: JoinFailureReason::SessionTimeLimitExceeded
            }]
        );
    }

    #[test]
    fn test_roster_diff_events() {
        let (engine, mut events) = pro_engine();
        engine.update_participants(ids(&["a"]));
        assert!(drain(&mut events).is_empty(), "no session yet");

        engine.setup_session(group("a", "b"));
        engine.mark_ready();
        drain(&mut events);

        engine.update_participants(ids(&["a", "b", "c"]));
        engine.update_participants(ids(&["a", "b", "c"]));
        engine.update_participants(ids(&["a", "b"]));

        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::ParticipantJoined("a".into()),
                SessionEvent::ParticipantJoined("b".into()),
                SessionEvent::ParticipantJoined("c".into()),
                SessionEvent::ParticipantLeft("c".into()),
            ]
        );
        assert_eq!(engine.peak_participants(), 3);
    }

    #[tokio::test]
    async fn test_free_tier_participant_limit_detaches_locally() {
        let (engine, mut events) = SyncEngine::new(EngineConfig::default());
        engine.setup_session(group("a", "c"));
        engine.mark_ready();
        drain(&mut events);

        engine.update_participants(ids(&["a", "b", "c"]));
        engine.update_participants(ids(&["a", "b", "c", "d"]));

        let failures: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::JoinFailed { .. }))
            .collect();
        assert_eq!(
            failures,
            vec![SessionEvent::JoinFailed {
                reason: JoinFailureReason::ParticipantLimitExceeded
            }]
        );

        // Detached locally only: the session and roster carry on
        assert_eq!(engine.session_state(), SessionState::Active);
        assert_eq!(engine.participants().len(), 4);
        assert!(!engine.share_play_enabled());
        assert_eq!(engine.spatial_snapshot(), SpatialSnapshot::solo());
        assert!(matches!(
            engine.send(&Chat { text: "hi".into() }).await,
            Err(TransportError::NoActiveSession)
        ));
    }

    #[test]
    fn test_pro_tier_allows_larger_groups() {
        let (engine, mut events) = pro_engine();
        engine.setup_session(group("a", "a"));
        engine.mark_ready();
        engine.update_participants(ids(&["a", "b", "c", "d"]));

        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, SessionEvent::JoinFailed { .. })));
        assert!(engine.share_play_enabled());
    }

    #[test]
    fn test_activation_after_session_keeps_tier() {
        let (engine, _events) = SyncEngine::new(EngineConfig::default());
        engine.setup_session(group("a", "a"));
        assert!(engine.inner.license.is_fixed());

        // Already fixed to free; the key is not even looked at
        assert_eq!(engine.activate(Some("garbage")).unwrap(), Tier::Free);
        assert_eq!(engine.tier(), Tier::Free);
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_session_detaches_after_time_limit() {
        let (engine, mut events) = SyncEngine::new(EngineConfig::default());
        engine.setup_session(group("a", "a"));
        engine.mark_ready();
        drain(&mut events);

        tokio::time::sleep(Duration::from_secs(14 * 60)).await;
        settle().await;
        assert!(engine.share_play_enabled());
        assert!(drain(&mut events).is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::JoinFailed {
                reason: JoinFailureReason::SessionTimeLimitExceeded
            }]
        );
        assert!(!engine.share_play_enabled());

        // Explicit checks after the fact do not fire again
        engine.enforce_time_limit();
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_disarms_time_limit() {
        let (engine, mut events) = SyncEngine::new(EngineConfig::default());
        engine.setup_session(group("a", "a"));
        engine.mark_ready();
        engine.handle_session_state_change(true);
        drain(&mut events);

        tokio::time::sleep(Duration::from_secs(20 * 60)).await;
        settle().await;
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_transforms_follow_session_mode() {
        let (engine, _events) = SyncEngine::new(EngineConfig::default());
        let role = AttachmentRole::preset("controls", PresetRole::ControlPanel);
        let config = TransformConfig::default();
        let engine_math = TransformEngine::new(config.clone());

        let solo = engine.get_transform(&role);
        assert!(solo.approx_eq(&engine_math.compute(&SpatialSnapshot::solo(), &role), 1e-5));

        engine.setup_session(group("a", "me"));
        engine.mark_ready();
        let fallback = engine.get_transform(&role);
        assert!(fallback.approx_eq(
            &engine_math.compute(&SpatialSnapshot::shared(None), &role),
            1e-5
        ));

        let seat = Mat4::from_translation(Vec3::new(2.0, 0.0, 0.0));
        engine.update_seat_pose(SeatPose::new("someone-else".into(), Mat4::IDENTITY));
        assert!(engine.get_transform(&role).approx_eq(&fallback, 1e-5));

        engine.update_seat_pose(SeatPose::new("me".into(), seat));
        let seated = engine.get_transform(&role);
        assert!(seated.approx_eq(
            &engine_math.compute(&SpatialSnapshot::shared(Some(seat)), &role),
            1e-5
        ));

        // Pure: same inputs, same output
        assert_eq!(engine.get_transform(&role), seated);

        engine.handle_session_state_change(true);
        assert!(engine.get_transform(&role).approx_eq(&solo, 1e-5));
    }

    #[tokio::test]
    async fn test_subscription_waits_for_ready_and_stops_on_cancel() {
        let (engine, _events) = SyncEngine::new(EngineConfig::default());
        let role = AttachmentRole::preset("toolbar", PresetRole::Toolbar);
        let target = Arc::new(Recorder::default());

        engine.setup_session(group("host", "me"));
        let subscription = engine.subscribe_to_transform_updates(&target, role.clone());
        settle().await;
        assert!(target.applied.lock().is_empty(), "pending is not ready");

        engine.mark_ready();
        settle().await;
        assert_eq!(target.applied.lock().len(), 1);

        let seat = Mat4::from_translation(Vec3::new(0.0, 0.0, 3.0));
        engine.update_seat_pose(SeatPose::new("me".into(), seat));
        settle().await;
        assert_eq!(target.applied.lock().len(), 2);
        assert_eq!(
            *target.applied.lock().last().unwrap(),
            engine.get_transform(&role)
        );

        subscription.cancel();
        subscription.cancel();
        engine.update_seat_pose(SeatPose::new("me".into(), Mat4::IDENTITY));
        settle().await;
        assert_eq!(target.applied.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_attachment_updates_skip_missing_roles() {
        let (engine, _events) = SyncEngine::new(EngineConfig::default());
        let panel: Arc<Recorder> = Arc::new(Recorder::default());
        let mut attachments: HashMap<String, Arc<dyn TransformTarget>> = HashMap::new();
        attachments.insert("panel".into(), panel.clone());

        let roles = vec![
            AttachmentRole::preset("panel", PresetRole::ControlPanel),
            AttachmentRole::preset("toast", PresetRole::Notification),
        ];
        let subscriptions = engine.handle_attachment_updates(&attachments, &roles);
        assert_eq!(subscriptions.role_ids().collect::<Vec<_>>(), vec!["panel"]);

        // Idle is solo and ready: applied straight away
        settle().await;
        assert_eq!(panel.applied.lock().len(), 1);

        drop(subscriptions);
        engine.setup_session(group("a", "a"));
        engine.mark_ready();
        settle().await;
        assert_eq!(panel.applied.lock().len(), 1);
    }

    /// Two engines wired back to back, both in an active session
    fn linked_pair() -> (SyncEngine, SyncEngine) {
        let (alice, _) = pro_engine();
        let (bob, _) = pro_engine();
        alice.setup_session(group("alice", "alice"));
        alice.mark_ready();
        bob.setup_session(group("alice", "bob"));
        bob.mark_ready();

        alice.attach_transport(Arc::new(Loopback { peer: bob.clone() }));
        bob.attach_transport(Arc::new(Loopback { peer: alice.clone() }));
        (alice, bob)
    }

    #[tokio::test]
    async fn test_message_reaches_every_listener_once() {
        let (alice, bob) = linked_pair();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(Mutex::new(Vec::new()));

        let f = Arc::clone(&first);
        bob.listen(move |_: Received<Chat>| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&second);
        bob.listen(move |r: Received<Chat>| s.lock().push((r.sender, r.message.text)));

        alice.send(&Chat { text: "popcorn?".into() }).await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(
            *second.lock(),
            vec![(ParticipantId::from("alice"), "popcorn?".to_string())]
        );
    }

    #[tokio::test]
    async fn test_send_without_session_or_transport() {
        let (engine, _events) = SyncEngine::new(EngineConfig::default());
        assert!(matches!(
            engine.send(&Chat { text: "x".into() }).await,
            Err(TransportError::NoActiveSession)
        ));

        engine.setup_session(group("a", "a"));
        engine.mark_ready();
        assert!(matches!(
            engine.send(&Chat { text: "x".into() }).await,
            Err(TransportError::NoTransport)
        ));
    }

    #[test]
    fn test_frames_outside_session_are_dropped() {
        let (engine, _events) = SyncEngine::new(EngineConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        engine.listen(move |_: Received<Chat>| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let frame = Envelope::wrap("x".into(), &Chat { text: "late".into() })
            .unwrap()
            .encode()
            .unwrap();
        assert_eq!(engine.deliver(&frame), 0);

        engine.setup_session(group("a", "a"));
        assert_eq!(engine.deliver(&frame), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    struct FakePlayer {
        rate: Mutex<f32>,
        position: Mutex<u64>,
    }

    impl FakePlayer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rate: Mutex::new(0.0),
                position: Mutex::new(0),
            })
        }
    }

    impl MediaPlayer for FakePlayer {
        fn has_content(&self) -> bool {
            true
        }
        fn rate(&self) -> f32 {
            *self.rate.lock()
        }
        fn set_rate(&self, rate: f32) {
            *self.rate.lock() = rate;
        }
        fn position_ms(&self) -> u64 {
            *self.position.lock()
        }
        fn seek_ms(&self, position_ms: u64) {
            *self.position.lock() = position_ms;
        }
    }

    #[tokio::test]
    async fn test_play_and_buffering_propagate() {
        let (alice, bob) = linked_pair();
        let alice_player = FakePlayer::new();
        let bob_player = FakePlayer::new();
        let rates = Arc::new(Mutex::new(Vec::new()));
        let waits = Arc::new(AtomicUsize::new(0));
        let completes = Arc::new(AtomicUsize::new(0));

        alice.register_player(alice_player.clone(), PlaybackHandlers::new());
        let (r, w, c) = (rates.clone(), waits.clone(), completes.clone());
        bob.register_player(
            bob_player.clone(),
            PlaybackHandlers::new()
                .on_rate_changed(move |rate| r.lock().push(rate))
                .on_waiting(move || {
                    w.fetch_add(1, Ordering::SeqCst);
                })
                .on_buffering_complete(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
        );

        alice.play();
        assert_eq!(alice_player.rate(), 1.0);
        assert_eq!(bob_player.rate(), 1.0);
        assert_eq!(*rates.lock(), vec![1.0]);

        alice.set_buffering(true);
        assert_eq!(waits.load(Ordering::SeqCst), 1);
        assert_eq!(bob_player.rate(), 0.0);

        alice.set_buffering(false);
        assert_eq!(completes.load(Ordering::SeqCst), 1);
        assert_eq!(bob_player.rate(), 1.0);

        alice.pause();
        assert_eq!(bob_player.rate(), 0.0);
        assert_eq!(*rates.lock(), vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_host_heartbeat_while_peer_buffers() {
        let (alice, bob) = linked_pair();
        let alice_player = FakePlayer::new();
        let bob_player = FakePlayer::new();
        let rates = Arc::new(Mutex::new(Vec::new()));

        alice.register_player(alice_player.clone(), PlaybackHandlers::new());
        let r = rates.clone();
        bob.register_player(
            bob_player.clone(),
            PlaybackHandlers::new().on_rate_changed(move |rate| r.lock().push(rate)),
        );

        alice.play();
        bob.set_buffering(true);
        assert_eq!(alice_player.rate(), 0.0);

        alice.send_heartbeat();
        assert_eq!(bob_player.rate(), 1.0);

        bob.set_buffering(false);
        assert_eq!(alice_player.rate(), 1.0);
        assert_eq!(bob_player.rate(), 1.0);
        assert_eq!(*rates.lock(), vec![1.0]);
    }

    #[tokio::test]
    async fn test_departed_peer_lifts_suspension() {
        let (alice, bob) = linked_pair();
        let bob_player = FakePlayer::new();
        let completes = Arc::new(AtomicUsize::new(0));
        let c = completes.clone();
        bob.register_player(
            bob_player,
            PlaybackHandlers::new().on_buffering_complete(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bob.update_participants(ids(&["alice", "bob"]));

        alice.set_buffering(true);
        bob.update_participants(ids(&["bob"]));
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_local_seek_is_not_broadcast() {
        let (alice, bob) = linked_pair();
        let alice_player = FakePlayer::new();
        let bob_player = FakePlayer::new();
        alice.register_player(alice_player.clone(), PlaybackHandlers::new());
        bob.register_player(bob_player.clone(), PlaybackHandlers::new());

        alice.seek(42_000);
        assert_eq!(alice_player.position_ms(), 42_000);
        assert_eq!(bob_player.position_ms(), 0);
    }
}
