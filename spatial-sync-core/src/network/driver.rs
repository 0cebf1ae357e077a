//! Group session driver
//!
//! Turns network events into engine calls: joining a group sets up the
//! session, topic subscriptions become roster snapshots and frames go to the
//! message bus.
//!
//! Guests learn who hosts from an announcement the host publishes whenever a
//! peer subscribes. The announcement must come from the peer that signed the
//! gossipsub message.

use std::collections::BTreeSet;
use std::iter;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::behaviour::NetworkEvent;
use crate::engine::SyncEngine;
use crate::messaging::{Envelope, GroupMessage, Transport};
use crate::session::{GroupSession, ParticipantId};

/// How often the host broadcasts its playback timeline
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GroupAnnounce {
    group: String,
}

impl GroupMessage for GroupAnnounce {
    const KIND: &'static str = "spatial-sync.announce";
}

#[derive(Debug)]
struct JoinedGroup {
    code: String,
    hosting: bool,
    /// Known once hosting or after the host's announcement
    host: Option<ParticipantId>,
}

pub struct GroupDriver {
    engine: SyncEngine,
    transport: Arc<dyn Transport>,
    local: ParticipantId,
    joined: Option<JoinedGroup>,
    /// Remote peers subscribed to the group topic
    peers: BTreeSet<ParticipantId>,
}

impl GroupDriver {
    pub fn new(engine: SyncEngine, transport: Arc<dyn Transport>, local: ParticipantId) -> Self {
        Self {
            engine,
            transport,
            local,
            joined: None,
            peers: BTreeSet::new(),
        }
    }

    /// Process network events until the network shuts down
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<NetworkEvent>) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Network event stream closed, driver stopping");
                        break;
                    };
                    self.handle_event(event);
                }
                _ = heartbeat.tick() => {
                    if self.engine.is_host() && self.engine.share_play_enabled() {
                        self.engine.send_heartbeat();
                    }
                }
            }
        }
    }

    pub fn handle_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Ready { peer_id } => {
                info!("Network ready with peer ID: {}", peer_id);
            }
            NetworkEvent::Joined { group, hosting } => self.on_joined(group, hosting),
            NetworkEvent::Left => self.on_left(),
            NetworkEvent::PeerSubscribed { peer_id } => {
                self.on_peer_subscribed(ParticipantId::from(peer_id))
            }
            NetworkEvent::PeerUnsubscribed { peer_id } => {
                self.on_peer_unsubscribed(ParticipantId::from(peer_id))
            }
            NetworkEvent::Frame { from, data } => self.on_frame(ParticipantId::from(from), &data),
            NetworkEvent::Error(e) => warn!("Network error: {}", e),
        }
    }

    fn session_started(&self) -> bool {
        self.joined.as_ref().is_some_and(|j| j.host.is_some())
    }

    fn on_joined(&mut self, code: String, hosting: bool) {
        self.peers.clear();
        self.joined = Some(JoinedGroup {
            code,
            hosting,
            host: hosting.then(|| self.local.clone()),
        });

        if hosting {
            self.start_session(self.local.clone());
        } else {
            info!("Joined group, waiting for the host to announce itself");
        }
    }

    fn on_left(&mut self) {
        self.joined = None;
        self.peers.clear();
        self.engine.handle_session_state_change(true);
    }

    fn on_peer_subscribed(&mut self, peer: ParticipantId) {
        if !self.peers.insert(peer) {
            return;
        }
        if self.joined.as_ref().is_some_and(|j| j.hosting) {
            self.announce();
        }
        if self.session_started() {
            self.sync_roster();
        }
    }

    fn on_peer_unsubscribed(&mut self, peer: ParticipantId) {
        if !self.peers.remove(&peer) {
            return;
        }

        let host_left = self
            .joined
            .as_ref()
            .is_some_and(|j| !j.hosting && j.host.as_ref() == Some(&peer));
        if host_left {
            info!("Host left the group, ending session");
            if let Some(joined) = self.joined.as_mut() {
                joined.host = None;
            }
            self.engine.handle_session_state_change(true);
        } else if self.session_started() {
            self.sync_roster();
        }
    }

    fn on_frame(&mut self, from: ParticipantId, data: &[u8]) {
        match Envelope::decode(data) {
            Ok(envelope) if envelope.kind == GroupAnnounce::KIND => {
                self.on_announce(from, envelope)
            }
            Ok(_) => {
                self.engine.deliver(data);
            }
            Err(e) => warn!("Dropping malformed frame from {}: {}", from, e),
        }
    }

    fn on_announce(&mut self, from: ParticipantId, envelope: Envelope) {
        if envelope.sender != from {
            warn!(
                "Ignoring host announcement claiming {} but signed by {}",
                envelope.sender, from
            );
            return;
        }
        let announce: GroupAnnounce = match serde_json::from_value(envelope.payload) {
            Ok(a) => a,
            Err(e) => {
                warn!("Malformed host announcement from {}: {}", from, e);
                return;
            }
        };

        let Some(joined) = self.joined.as_mut() else {
            debug!("Host announcement outside a group, ignoring");
            return;
        };
        if joined.hosting || announce.group != joined.code {
            debug!("Ignoring announcement from {} for '{}'", from, announce.group);
            return;
        }
        if let Some(host) = &joined.host {
            if *host != from {
                warn!("{} announced itself as host but {} already is", from, host);
            }
            return;
        }
        joined.host = Some(from.clone());

        info!("{} hosts the group", from);
        self.peers.insert(from.clone());
        self.start_session(from);
    }

    fn announce(&self) {
        let Some(joined) = self.joined.as_ref() else {
            return;
        };
        let announce = GroupAnnounce {
            group: joined.code.clone(),
        };
        let frame = match Envelope::wrap(self.local.clone(), &announce).and_then(|e| e.encode()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode host announcement: {}", e);
                return;
            }
        };
        if let Err(e) = self.transport.publish(frame) {
            warn!("Failed to publish host announcement: {}", e);
        }
    }

    fn start_session(&self, host: ParticipantId) {
        let Some(joined) = self.joined.as_ref() else {
            return;
        };
        self.engine.setup_session(GroupSession {
            id: joined.code.clone(),
            host,
            local: self.local.clone(),
        });
        self.engine.mark_ready();
        self.sync_roster();
    }

    fn sync_roster(&self) {
        let roster = iter::once(self.local.clone()).chain(self.peers.iter().cloned());
        self.engine.update_participants(roster);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::messaging::{Received, TransportError};
    use crate::session::{SessionEvent, SessionState};
    use parking_lot::Mutex;

    const CODE: &str = "ABCD3467";

    #[derive(Default)]
    struct CapturingTransport {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl Transport for CapturingTransport {
        fn publish(&self, frame: Vec<u8>) -> Result<(), TransportError> {
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    fn driver(local: &str) -> (GroupDriver, SyncEngine, mpsc::UnboundedReceiver<SessionEvent>, Arc<CapturingTransport>) {
        let (engine, events) = SyncEngine::new(EngineConfig::default());
        let transport = Arc::new(CapturingTransport::default());
        let driver = GroupDriver::new(engine.clone(), transport.clone(), local.into());
        (driver, engine, events, transport)
    }

    fn announce_frame(sender: &str, group: &str) -> Vec<u8> {
        Envelope::wrap(
            ParticipantId::from(sender),
            &GroupAnnounce {
                group: group.to_string(),
            },
        )
        .unwrap()
        .encode()
        .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_hosting_starts_session_and_announces() {
        let (mut driver, engine, mut events, transport) = driver("alice");

        driver.handle_event(NetworkEvent::Joined {
            group: CODE.into(),
            hosting: true,
        });
        assert_eq!(engine.session_state(), SessionState::Active);
        assert!(engine.is_host());

        driver.handle_event(NetworkEvent::PeerSubscribed {
            peer_id: "bob".into(),
        });
        let frames = transport.frames.lock();
        assert_eq!(frames.len(), 1);
        let envelope = Envelope::decode(&frames[0]).unwrap();
        assert_eq!(envelope.kind, GroupAnnounce::KIND);
        assert_eq!(envelope.sender, ParticipantId::from("alice"));

        let joined: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::ParticipantJoined(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(joined, vec!["alice".into(), "bob".into()]);
    }

    #[test]
    fn test_guest_waits_for_announcement() {
        let (mut driver, engine, _events, _) = driver("bob");

        driver.handle_event(NetworkEvent::Joined {
            group: CODE.into(),
            hosting: false,
        });
        assert_eq!(engine.session_state(), SessionState::Idle);

        driver.handle_event(NetworkEvent::PeerSubscribed {
            peer_id: "alice".into(),
        });
        driver.handle_event(NetworkEvent::Frame {
            from: "alice".into(),
            data: announce_frame("alice", CODE),
        });

        assert_eq!(engine.session_state(), SessionState::Active);
        let session = engine.current_session().unwrap();
        assert_eq!(session.host(), &ParticipantId::from("alice"));
        assert_eq!(session.group_id(), CODE);
        assert_eq!(engine.participants().len(), 2);

        // Repeated announcements do not restart the session
        let id = session.id();
        driver.handle_event(NetworkEvent::Frame {
            from: "alice".into(),
            data: announce_frame("alice", CODE),
        });
        assert_eq!(engine.current_session().unwrap().id(), id);
    }

    #[test]
    fn test_forged_announcement_is_ignored() {
        let (mut driver, engine, _events, _) = driver("bob");
        driver.handle_event(NetworkEvent::Joined {
            group: CODE.into(),
            hosting: false,
        });

        driver.handle_event(NetworkEvent::Frame {
            from: "mallory".into(),
            data: announce_frame("alice", CODE),
        });
        driver.handle_event(NetworkEvent::Frame {
            from: "alice".into(),
            data: announce_frame("alice", "OTHER678"),
        });
        assert_eq!(engine.session_state(), SessionState::Idle);
    }

    #[test]
    fn test_host_departure_ends_guest_session() {
        let (mut driver, engine, mut events, _) = driver("bob");
        driver.handle_event(NetworkEvent::Joined {
            group: CODE.into(),
            hosting: false,
        });
        driver.handle_event(NetworkEvent::Frame {
            from: "alice".into(),
            data: announce_frame("alice", CODE),
        });
        drain(&mut events);

        driver.handle_event(NetworkEvent::PeerUnsubscribed {
            peer_id: "alice".into(),
        });
        assert_eq!(engine.session_state(), SessionState::Invalidated);
        assert!(matches!(
            drain(&mut events).as_slice(),
            [SessionEvent::Invalidated { .. }]
        ));
    }

    #[test]
    fn test_application_frames_reach_the_bus() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct Wave;
        impl GroupMessage for Wave {
            const KIND: &'static str = "test.wave";
        }

        let (mut driver, engine, _events, _) = driver("alice");
        let waves = Arc::new(Mutex::new(Vec::new()));
        let w = Arc::clone(&waves);
        engine.listen(move |r: Received<Wave>| w.lock().push(r.sender));

        driver.handle_event(NetworkEvent::Joined {
            group: CODE.into(),
            hosting: true,
        });
        let frame = Envelope::wrap("bob".into(), &Wave).unwrap().encode().unwrap();
        driver.handle_event(NetworkEvent::Frame {
            from: "bob".into(),
            data: frame,
        });

        assert_eq!(*waves.lock(), vec![ParticipantId::from("bob")]);
    }

    #[test]
    fn test_leaving_invalidates() {
        let (mut driver, engine, _events, _) = driver("alice");
        driver.handle_event(NetworkEvent::Joined {
            group: CODE.into(),
            hosting: true,
        });
        driver.handle_event(NetworkEvent::Left);
        assert_eq!(engine.session_state(), SessionState::Invalidated);
    }
}
