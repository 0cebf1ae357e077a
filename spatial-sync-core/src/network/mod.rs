//! P2P Networking
//!
//! Uses libp2p gossipsub to carry group traffic between participants.

mod behaviour;
mod driver;
mod group_code;

pub use behaviour::{NetworkCommand, NetworkConfig, NetworkError, NetworkEvent, NetworkHandle, NetworkManager};
pub use driver::{GroupDriver, HEARTBEAT_INTERVAL};
pub use group_code::GroupCode;
