//! Session implementation for FFI

use std::collections::HashMap;
use std::sync::{Arc, Once};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{EngineConfig, SyncEngine};
use crate::license::LicenseConfig;
use crate::messaging::ListenerToken;
use crate::network::{GroupCode, GroupDriver, NetworkConfig, NetworkHandle, NetworkManager};
use crate::playback::{MediaPlayer, PlaybackHandlers};
use crate::session::{ParticipantId, SessionEvent};
use crate::spatial::{AttachmentRole, Mat4, SeatPose};

use super::types::*;

static TRACING_INIT: Once = Once::new();

type SharedCallback = Arc<RwLock<Option<Arc<dyn SessionCallback>>>>;

/// Current callback, cloned out so no lock is held while foreign code runs
fn current_callback(slot: &SharedCallback) -> Option<Arc<dyn SessionCallback>> {
    slot.read().clone()
}

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(
                "spatial_sync_core=debug,libp2p_mdns=info,libp2p_gossipsub=info",
            )
        });
        tracing_subscriber::fmt()
            .with_ansi(false) // Disable colors for Xcode console
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    });
}

/// Adapts the app's player to the coordinator
struct PlayerBridge(Box<dyn NativePlayer>);

impl MediaPlayer for PlayerBridge {
    fn has_content(&self) -> bool {
        self.0.has_content()
    }
    fn rate(&self) -> f32 {
        self.0.rate()
    }
    fn set_rate(&self, rate: f32) {
        self.0.set_rate(rate)
    }
    fn position_ms(&self) -> u64 {
        self.0.position_ms()
    }
    fn seek_ms(&self, position_ms: u64) {
        self.0.seek_ms(position_ms)
    }
}

/// Main session interface
#[derive(uniffi::Object)]
pub struct SyncSession {
    runtime: Runtime,
    engine: SyncEngine,
    callback: SharedCallback,
    network_handle: Mutex<Option<NetworkHandle>>,
    /// Listener tokens by id, as handed out to the app
    listeners: Mutex<HashMap<u64, ListenerToken>>,
}

#[uniffi::export]
impl SyncSession {
    /// Create a session. The licence is verified here, before any group exists.
    #[uniffi::constructor]
    pub fn new(
        bundle_id: String,
        vendor_public_key: Option<String>,
        license_key: Option<String>,
    ) -> Result<Self, CoreError> {
        init_tracing();
        info!("Initializing spatial-sync-core session");

        let runtime = Runtime::new().map_err(|e| CoreError::Runtime(e.to_string()))?;

        let config = EngineConfig {
            license: LicenseConfig {
                bundle_id,
                vendor_public_key,
            },
            ..Default::default()
        };
        let (engine, event_rx) = SyncEngine::with_runtime(config, runtime.handle().clone());

        // A bad key leaves the session on the free tier rather than failing it
        if let Err(e) = engine.activate(license_key.as_deref()) {
            warn!("Licence not accepted: {}", e);
        }

        let callback: SharedCallback = Arc::new(RwLock::new(None));
        runtime.spawn(forward_events(event_rx, Arc::clone(&callback)));

        Ok(Self {
            runtime,
            engine,
            callback,
            network_handle: Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    /// Start a new group and return its shareable code
    pub fn host_group(&self) -> Result<String, CoreError> {
        let handle = self.ensure_network_running()?;
        let code = GroupCode::random();
        handle.join_group(code.as_str(), true)?;
        info!("Hosting group {}", code);
        Ok(code.to_string())
    }

    /// Join a group by code
    pub fn join_group(&self, code: String) -> Result<(), CoreError> {
        let parsed = GroupCode::parse(&code).ok_or(CoreError::InvalidGroupCode(code))?;
        let handle = self.ensure_network_running()?;
        handle.join_group(parsed.as_str(), false)?;
        info!("Joining group {}", parsed);
        Ok(())
    }

    pub fn leave_group(&self) -> Result<(), CoreError> {
        let guard = self.network_handle.lock();
        let handle = guard.as_ref().ok_or(CoreError::NotInGroup)?;
        handle.leave_group()?;
        Ok(())
    }

    /// Dial a peer directly when discovery cannot find it
    pub fn dial_peer(&self, multiaddr: String) -> Result<(), CoreError> {
        let handle = self.ensure_network_running()?;
        handle.dial_peer(&multiaddr)?;
        Ok(())
    }

    /// Signal readiness of the coordinating layer
    pub fn mark_ready(&self) {
        self.engine.mark_ready();
    }

    pub fn session_state(&self) -> SessionStatus {
        self.engine.session_state().into()
    }

    pub fn share_play_enabled(&self) -> bool {
        self.engine.share_play_enabled()
    }

    pub fn participants(&self) -> Vec<String> {
        self.engine
            .participants()
            .iter()
            .map(|p| p.to_string())
            .collect()
    }

    pub fn tier(&self) -> LicenseTier {
        self.engine.tier().into()
    }

    // ========== Messaging ==========

    /// Send a JSON payload of the given kind to the group
    pub fn send_message(&self, kind: String, json: String) -> Result<(), CoreError> {
        let payload: serde_json::Value =
            serde_json::from_str(&json).map_err(|e| CoreError::InvalidMessage(e.to_string()))?;
        self.engine.send_raw(&kind, payload)?;
        Ok(())
    }

    /// Deliver messages of `kind` to `on_message`. Returns a listener id.
    pub fn listen(&self, kind: String) -> u64 {
        let callback = Arc::clone(&self.callback);
        let token = self.engine.listen_raw(&kind, move |envelope| {
            if let Some(cb) = current_callback(&callback) {
                cb.on_message(
                    envelope.kind.clone(),
                    envelope.sender.to_string(),
                    envelope.payload.to_string(),
                );
            }
        });
        let id = token.id();
        self.listeners.lock().insert(id, token);
        id
    }

    pub fn remove_listener(&self, listener_id: u64) -> bool {
        match self.listeners.lock().remove(&listener_id) {
            Some(token) => self.engine.remove_listener(&token),
            None => false,
        }
    }

    // ========== Spatial ==========

    /// Column-major 4x4 seat pose for a participant
    pub fn update_seat_pose(&self, participant_id: String, transform: Vec<f32>) -> Result<(), CoreError> {
        let cols: [f32; 16] = transform
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::InvalidTransform(transform.len() as u32))?;
        self.engine.update_seat_pose(SeatPose::new(
            ParticipantId::from(participant_id),
            Mat4::from_cols_array(cols),
        ));
        Ok(())
    }

    /// Column-major 4x4 transform for a placement
    pub fn get_transform(&self, placement: PresetPlacement) -> Vec<f32> {
        let role = AttachmentRole::preset(format!("{:?}", placement), placement.into());
        self.engine.get_transform(&role).to_cols_array().to_vec()
    }

    // ========== Playback ==========

    pub fn register_player(&self, player: Box<dyn NativePlayer>) {
        let waiting = Arc::clone(&self.callback);
        let resumed = Arc::clone(&self.callback);
        let rate = Arc::clone(&self.callback);

        let handlers = PlaybackHandlers::new()
            .on_waiting(move || {
                if let Some(cb) = current_callback(&waiting) {
                    cb.on_playback_waiting();
                }
            })
            .on_buffering_complete(move || {
                if let Some(cb) = current_callback(&resumed) {
                    cb.on_playback_resumed();
                }
            })
            .on_rate_changed(move |r| {
                if let Some(cb) = current_callback(&rate) {
                    cb.on_rate_changed(r);
                }
            });

        self.engine
            .register_player(Arc::new(PlayerBridge(player)), handlers);
    }

    pub fn play(&self) {
        self.engine.play();
    }

    pub fn pause(&self) {
        self.engine.pause();
    }

    pub fn seek(&self, position_ms: u64) {
        self.engine.seek(position_ms);
    }

    pub fn set_buffering(&self, buffering: bool) {
        self.engine.set_buffering(buffering);
    }
}

impl SyncSession {
    /// Start the network on first use and wire it to the engine
    fn ensure_network_running(&self) -> Result<NetworkHandle, CoreError> {
        let mut guard = self.network_handle.lock();
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }

        let config = NetworkConfig {
            max_transmit_size: self.engine.config().bus.max_payload_bytes,
            ..Default::default()
        };
        let manager = NetworkManager::new(config);
        let (handle, event_rx) = self.runtime.block_on(async { manager.start() });
        let local = ParticipantId::from(handle.local_peer_id.clone());

        let transport = Arc::new(handle.clone());
        self.engine.attach_transport(transport.clone());

        let driver = GroupDriver::new(self.engine.clone(), transport, local);
        self.runtime.spawn(driver.run(event_rx));

        debug!("Network started as {}", handle.local_peer_id);
        *guard = Some(handle.clone());
        Ok(handle)
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(handle) = self.network_handle.lock().take() {
            handle.shutdown();
        }
        self.engine.detach_transport();
    }
}

async fn forward_events(mut events: mpsc::UnboundedReceiver<SessionEvent>, callback: SharedCallback) {
    while let Some(event) = events.recv().await {
        let Some(cb) = current_callback(&callback) else {
            debug!("No callback set, dropping {:?}", event);
            continue;
        };
        match event {
            SessionEvent::Ready { session_id } => cb.on_ready(session_id.to_string()),
            SessionEvent::Hosted { session_id } => cb.on_hosted(session_id.to_string()),
            SessionEvent::ParticipantJoined(id) => cb.on_participant_joined(id.to_string()),
            SessionEvent::ParticipantLeft(id) => cb.on_participant_left(id.to_string()),
            SessionEvent::JoinFailed { reason } => cb.on_join_failed(reason.into()),
            SessionEvent::Invalidated { session_id } => cb.on_invalidated(session_id.to_string()),
        }
    }
}
