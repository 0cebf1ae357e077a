//! Group messaging
//!
//! Application-defined messages fanned out to every participant of the session.

mod bus;
mod envelope;
mod transport;

pub use bus::{BusConfig, ListenerToken, MessageBus, DEFAULT_MAX_PAYLOAD_BYTES};
pub use envelope::{Envelope, GroupMessage, Received};
pub use transport::{Transport, TransportError};
