//! Swarm that carries group traffic
//!
//! Each group is one gossipsub topic. Peers on the same LAN find each other
//! over mDNS; anything else is dialled explicitly. TCP and QUIC are both
//! enabled so whichever the network allows wins.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    gossipsub, identify, identity, mdns, noise, ping,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Swarm,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::messaging::{Transport, TransportError, DEFAULT_MAX_PAYLOAD_BYTES};

/// Gossipsub topic prefix; the group code is appended
const TOPIC_PREFIX: &str = "spatial-sync-";

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Announce and discover peers on the LAN
    pub enable_mdns: bool,
    pub listen_tcp: bool,
    pub listen_quic: bool,
    /// Multiaddrs dialled on startup
    pub bootstrap_peers: Vec<String>,
    /// Largest frame gossipsub will carry; keep equal to the bus limit
    pub max_transmit_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enable_mdns: true,
            listen_tcp: true,
            listen_quic: true,
            bootstrap_peers: Vec::new(),
            max_transmit_size: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Transport setup failed: {0}")]
    Transport(String),

    #[error("Already in a group")]
    AlreadyInGroup,

    #[error("Not in a group")]
    NotInGroup,

    #[error("Swarm rejected request: {0}")]
    Libp2p(String),

    #[error("Network task closed")]
    Closed,
}

#[derive(NetworkBehaviour)]
pub struct SpatialBehaviour {
    ping: ping::Behaviour,
    /// Off when [`NetworkConfig::enable_mdns`] is false
    mdns: Toggle<mdns::tokio::Behaviour>,
    identify: identify::Behaviour,
    /// Pub/sub for group frames
    gossipsub: gossipsub::Behaviour,
}

/// What the swarm task reports back
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Listeners are up
    Ready { peer_id: String },
    /// Subscribed to the group topic
    Joined { group: String, hosting: bool },
    Left,
    PeerSubscribed { peer_id: String },
    /// Unsubscribed, or its last connection closed
    PeerUnsubscribed { peer_id: String },
    /// An encoded envelope from the group
    Frame { from: String, data: Vec<u8> },
    Error(String),
}

#[derive(Debug)]
pub enum NetworkCommand {
    JoinGroup { group: String, hosting: bool },
    LeaveGroup,
    Publish { frame: Vec<u8> },
    /// For peers mDNS cannot reach
    DialPeer { multiaddr: String },
    Shutdown,
}

/// Cloneable sender side of the swarm task
#[derive(Clone)]
pub struct NetworkHandle {
    commands: mpsc::UnboundedSender<NetworkCommand>,
    pub local_peer_id: String,
}

impl NetworkHandle {
    fn send(&self, command: NetworkCommand) -> Result<(), NetworkError> {
        self.commands
            .send(command)
            .map_err(|_| NetworkError::Closed)
    }

    pub fn join_group(&self, group: &str, hosting: bool) -> Result<(), NetworkError> {
        self.send(NetworkCommand::JoinGroup {
            group: group.to_string(),
            hosting,
        })
    }

    pub fn leave_group(&self) -> Result<(), NetworkError> {
        self.send(NetworkCommand::LeaveGroup)
    }

    pub fn dial_peer(&self, addr: &str) -> Result<(), NetworkError> {
        self.send(NetworkCommand::DialPeer {
            multiaddr: addr.to_owned(),
        })
    }

    /// Stop the swarm task. A no-op once it has exited.
    pub fn shutdown(&self) {
        if self.send(NetworkCommand::Shutdown).is_err() {
            debug!("Swarm task already stopped");
        }
    }
}

impl Transport for NetworkHandle {
    fn publish(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.send(NetworkCommand::Publish { frame })
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

/// Owns the swarm until [`NetworkManager::start`] moves it onto a task
pub struct NetworkManager {
    peer_id: PeerId,
    keypair: identity::Keypair,
    config: NetworkConfig,
    group_topic: Option<gossipsub::IdentTopic>,
    /// Remote subscribers of `group_topic`
    group_peers: BTreeSet<PeerId>,
}

impl NetworkManager {
    /// Fresh ed25519 identity per process
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_keypair(identity::Keypair::generate_ed25519(), config)
    }

    pub fn with_keypair(keypair: identity::Keypair, config: NetworkConfig) -> Self {
        let peer_id = keypair.public().to_peer_id();
        info!("Network identity {}", peer_id);

        Self {
            peer_id,
            keypair,
            config,
            group_topic: None,
            group_peers: BTreeSet::new(),
        }
    }

    /// Spawn the swarm task. Must be called from within a tokio runtime.
    pub fn start(self) -> (NetworkHandle, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let handle = NetworkHandle {
            commands,
            local_peer_id: self.peer_id.to_string(),
        };

        tokio::spawn(async move {
            let errors = event_tx.clone();
            if let Err(e) = self.run(event_tx, command_rx).await {
                warn!("Swarm task stopped: {}", e);
                let _ = errors.send(NetworkEvent::Error(e.to_string()));
            }
        });

        (handle, event_rx)
    }

    fn create_swarm(&self) -> Result<Swarm<SpatialBehaviour>, NetworkError> {
        let enable_mdns = self.config.enable_mdns;
        let max_transmit_size = self.config.max_transmit_size;

        let swarm = libp2p::SwarmBuilder::with_existing_identity(self.keypair.clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NetworkError::Transport(e.to_string()))?
            // QUIC has built-in encryption/mux
            .with_quic()
            .with_behaviour(|keypair| {
                let ping = ping::Behaviour::new(
                    ping::Config::new()
                        .with_interval(Duration::from_secs(15))
                        .with_timeout(Duration::from_secs(20)),
                );

                let mdns = if enable_mdns {
                    Some(
                        mdns::tokio::Behaviour::new(
                            mdns::Config::default(),
                            keypair.public().to_peer_id(),
                        )
                        .map_err(|e| e.to_string())?,
                    )
                } else {
                    None
                };

                // Groups are a handful of peers; builder rejects a non-monotonic mesh
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .max_transmit_size(max_transmit_size)
                    .mesh_outbound_min(0)
                    .mesh_n_low(1)
                    .mesh_n(3)
                    .mesh_n_high(6)
                    .gossip_lazy(3)
                    .build()
                    .map_err(|e| e.to_string())?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(keypair.clone()),
                    gossipsub_config,
                )
                .map_err(|e| e.to_string())?;

                let identify = identify::Behaviour::new(identify::Config::new(
                    "/spatial-sync/1.0.0".into(),
                    keypair.public(),
                ));

                Ok(SpatialBehaviour {
                    ping,
                    mdns: Toggle::from(mdns),
                    identify,
                    gossipsub,
                })
            })
            .map_err(|e| NetworkError::Transport(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(5 * 60)))
            .build();

        Ok(swarm)
    }

    fn listen(swarm: &mut Swarm<SpatialBehaviour>, addr: &str) {
        let addr: Multiaddr = match addr.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Invalid listen address {}: {}", addr, e);
                return;
            }
        };
        match swarm.listen_on(addr.clone()) {
            Ok(id) => info!("Listener started on {}: {:?}", addr, id),
            Err(e) => warn!("Failed to listen on {}: {:?}", addr, e),
        }
    }

    fn dial(swarm: &mut Swarm<SpatialBehaviour>, addr: &str) {
        let parsed: Multiaddr = match addr.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Cannot dial '{}': {}", addr, e);
                return;
            }
        };
        debug!("Dialling {}", parsed);
        if let Err(e) = swarm.dial(parsed.clone()) {
            warn!("Dial of {} failed: {}", parsed, e);
        }
    }

    async fn run(
        mut self,
        event_tx: mpsc::UnboundedSender<NetworkEvent>,
        mut command_rx: mpsc::UnboundedReceiver<NetworkCommand>,
    ) -> Result<(), NetworkError> {
        let mut swarm = self.create_swarm()?;

        if self.config.listen_tcp {
            Self::listen(&mut swarm, "/ip4/0.0.0.0/tcp/0");
        }
        if self.config.listen_quic {
            Self::listen(&mut swarm, "/ip4/0.0.0.0/udp/0/quic-v1");
        }
        for peer in &self.config.bootstrap_peers {
            Self::dial(&mut swarm, peer);
        }

        let _ = event_tx.send(NetworkEvent::Ready {
            peer_id: self.peer_id.to_string(),
        });

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.on_swarm_event(&mut swarm, event, &event_tx);
                }
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("All network handles dropped, shutting down");
                        break;
                    };
                    match cmd {
                        NetworkCommand::JoinGroup { group, hosting } => {
                            match self.join_group(&mut swarm, &group) {
                                Ok(()) => {
                                    let _ = event_tx.send(NetworkEvent::Joined { group, hosting });
                                }
                                Err(e) => {
                                    let _ = event_tx.send(NetworkEvent::Error(e.to_string()));
                                }
                            }
                        }
                        NetworkCommand::LeaveGroup => {
                            if self.leave_group(&mut swarm) {
                                let _ = event_tx.send(NetworkEvent::Left);
                            }
                        }
                        NetworkCommand::Publish { frame } => {
                            if let Err(e) = self.publish(&mut swarm, frame) {
                                debug!("Publish error (may be no peers yet): {}", e);
                            }
                        }
                        NetworkCommand::DialPeer { multiaddr } => {
                            Self::dial(&mut swarm, &multiaddr);
                        }
                        NetworkCommand::Shutdown => {
                            info!("Swarm task shutting down");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn on_swarm_event(
        &mut self,
        swarm: &mut Swarm<SpatialBehaviour>,
        event: SwarmEvent<SpatialBehaviourEvent>,
        event_tx: &mpsc::UnboundedSender<NetworkEvent>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Reachable at {}/p2p/{}", address, self.peer_id);
            }

            SwarmEvent::Behaviour(SpatialBehaviourEvent::Mdns(event)) => {
                self.on_mdns(swarm, event);
            }

            SwarmEvent::Behaviour(SpatialBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let from = message.source.unwrap_or(propagation_source);
                debug!("Received {} byte frame from {}", message.data.len(), from);
                let _ = event_tx.send(NetworkEvent::Frame {
                    from: from.to_string(),
                    data: message.data,
                });
            }

            SwarmEvent::Behaviour(SpatialBehaviourEvent::Gossipsub(
                gossipsub::Event::Subscribed { peer_id, topic },
            )) => {
                let ours = self.group_topic.as_ref().is_some_and(|t| t.hash() == topic);
                if ours && self.group_peers.insert(peer_id) {
                    info!("{} subscribed to the group topic", peer_id);
                    let _ = event_tx.send(NetworkEvent::PeerSubscribed {
                        peer_id: peer_id.to_string(),
                    });
                }
            }

            SwarmEvent::Behaviour(SpatialBehaviourEvent::Gossipsub(
                gossipsub::Event::Unsubscribed { peer_id, topic },
            )) => {
                if self.group_topic.as_ref().is_some_and(|t| t.hash() == topic) {
                    self.peer_gone(peer_id, event_tx);
                }
            }

            SwarmEvent::Behaviour(SpatialBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!("{} speaks {} ({})", peer_id, info.protocol_version, info.agent_version);
            }

            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!("Connected to {} at {}", peer_id, endpoint.get_remote_address());
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    debug!("Last connection to {} closed", peer_id);
                    self.peer_gone(peer_id, event_tx);
                }
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => match peer_id {
                Some(peer) => warn!("Could not reach {}: {}", peer, error),
                None => warn!("Outbound dial failed: {}", error),
            },

            SwarmEvent::ListenerError { error, .. } => {
                warn!("Listener failed: {}", error);
            }

            _ => {}
        }
    }

    fn on_mdns(&self, swarm: &mut Swarm<SpatialBehaviour>, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(found) => {
                for (peer, addr) in found.into_iter().filter(|(p, _)| *p != self.peer_id) {
                    debug!("Found {} on the LAN at {}", peer, addr);
                    swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer);
                    if let Err(e) = swarm.dial(addr) {
                        debug!("Dial of LAN peer {} failed: {}", peer, e);
                    }
                }
            }
            mdns::Event::Expired(gone) => {
                for (peer, _) in gone {
                    debug!("LAN record for {} expired", peer);
                }
            }
        }
    }

    fn peer_gone(&mut self, peer_id: PeerId, event_tx: &mpsc::UnboundedSender<NetworkEvent>) {
        if self.group_peers.remove(&peer_id) {
            info!("{} left the group topic", peer_id);
            let _ = event_tx.send(NetworkEvent::PeerUnsubscribed {
                peer_id: peer_id.to_string(),
            });
        }
    }

    /// Subscribe to the group's topic
    fn join_group(
        &mut self,
        swarm: &mut Swarm<SpatialBehaviour>,
        group: &str,
    ) -> Result<(), NetworkError> {
        if self.group_topic.is_some() {
            return Err(NetworkError::AlreadyInGroup);
        }

        let topic = gossipsub::IdentTopic::new(format!("{}{}", TOPIC_PREFIX, group));
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| NetworkError::Libp2p(e.to_string()))?;

        info!("Joined group: {}", group);
        self.group_topic = Some(topic);
        self.group_peers.clear();
        Ok(())
    }

    /// Leave the current group. Returns false if not in one.
    fn leave_group(&mut self, swarm: &mut Swarm<SpatialBehaviour>) -> bool {
        let Some(topic) = self.group_topic.take() else {
            return false;
        };
        let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
        self.group_peers.clear();
        info!("Left group");
        true
    }

    fn publish(
        &self,
        swarm: &mut Swarm<SpatialBehaviour>,
        frame: Vec<u8>,
    ) -> Result<(), NetworkError> {
        let topic = self.group_topic.as_ref().ok_or(NetworkError::NotInGroup)?;
        swarm
            .behaviour_mut()
            .gossipsub
            .publish(topic.clone(), frame)
            .map_err(|e| NetworkError::Libp2p(e.to_string()))?;
        Ok(())
    }
}
