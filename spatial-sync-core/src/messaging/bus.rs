//! Message Bus
//!
//! Typed publish/subscribe over an opaque transport. Delivery is best-effort
//! and at-most-once; there is no ordering guarantee across message kinds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::envelope::{Envelope, GroupMessage, Received};
use super::transport::{Transport, TransportError};
use crate::session::ParticipantId;

/// Default frame size limit (matches the gossipsub default transmit size)
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

type RawHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Bus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub max_payload_bytes: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Returned by `listen`; pass to `remove_listener` to deregister
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerToken {
    id: u64,
    kind: String,
}

impl ListenerToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

pub struct MessageBus {
    config: BusConfig,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    listeners: RwLock<HashMap<String, Vec<(u64, RawHandler)>>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            transport: RwLock::new(None),
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
    }

    pub fn clear_transport(&self) {
        self.transport.write().take();
    }

    /// Encode and publish `message` with the given in-band sender
    pub fn send_as<T: GroupMessage>(
        &self,
        sender: &ParticipantId,
        message: &T,
    ) -> Result<(), TransportError> {
        let frame = Envelope::wrap(sender.clone(), message)?.encode()?;
        let size = frame.len();
        self.publish_frame(frame)?;
        debug!("Sent '{}' message ({} bytes)", T::KIND, size);
        Ok(())
    }

    /// Publish an already-built envelope (untyped callers)
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = envelope.encode()?;
        self.publish_frame(frame)
    }

    fn publish_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if frame.len() > self.config.max_payload_bytes {
            return Err(TransportError::PayloadTooLarge {
                size: frame.len(),
                limit: self.config.max_payload_bytes,
            });
        }

        let transport = self
            .transport
            .read()
            .clone()
            .ok_or(TransportError::NoTransport)?;
        transport.publish(frame)
    }

    /// Register a handler for every received message of type `T`
    pub fn listen<T, F>(&self, handler: F) -> ListenerToken
    where
        T: GroupMessage,
        F: Fn(Received<T>) + Send + Sync + 'static,
    {
        self.listen_raw(T::KIND, move |envelope: &Envelope| {
            match serde_json::from_value::<T>(envelope.payload.clone()) {
                Ok(message) => handler(Received {
                    sender: envelope.sender.clone(),
                    message,
                }),
                Err(e) => warn!(
                    "Dropping '{}' message from {}: payload does not decode ({})",
                    envelope.kind, envelope.sender, e
                ),
            }
        })
    }

    /// Register an untyped handler for one message kind
    pub fn listen_raw<F>(&self, kind: &str, handler: F) -> ListenerToken
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        debug!("Listener {} registered for '{}'", id, kind);
        ListenerToken {
            id,
            kind: kind.to_string(),
        }
    }

    /// Deregister a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, token: &ListenerToken) -> bool {
        let mut listeners = self.listeners.write();
        let Some(handlers) = listeners.get_mut(&token.kind) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|(id, _)| *id != token.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            listeners.remove(&token.kind);
        }
        removed
    }

    pub fn listener_count(&self, kind: &str) -> usize {
        self.listeners.read().get(kind).map(Vec::len).unwrap_or(0)
    }

    /// Decode an inbound frame and dispatch it. Returns the number of handlers invoked.
    pub fn deliver(&self, frame: &[u8]) -> usize {
        match Envelope::decode(frame) {
            Ok(envelope) => self.dispatch(&envelope),
            Err(e) => {
                warn!("Dropping malformed frame ({} bytes): {}", frame.len(), e);
                0
            }
        }
    }

    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        // Snapshot so handlers may add or remove listeners
        let handlers: Vec<RawHandler> = self
            .listeners
            .read()
            .get(&envelope.kind)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!("No listener for '{}' from {}", envelope.kind, envelope.sender);
        }

        for handler in &handlers {
            handler(envelope);
        }
        handlers.len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}
