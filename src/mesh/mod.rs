//! Relay mesh
//!
//! Peer relays authenticate each other, gossip which relay hosts which room
//! and forward signaling so a stream ingested on one relay can be watched
//! through any other.

mod approval;
mod error;
mod forward;
mod manager;
mod messages;
mod peer;
mod state;

use std::time::Duration;

pub use approval::{count_valid_approvals, eviction_threshold, request_approvals, required_approvals};
pub use error::MeshError;
pub use forward::{relay_data_label, LinkRole, RelayLink};
pub use manager::{mesh_url, MeshManager};
pub use messages::{MeshFrame, MeshMessage};
pub use peer::{PeerRelay, PendingAcks};
pub use state::{MeshState, RoomEntity, StateTransition};

/// Periods driving the mesh background loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshTimings {
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is suspected; also the monitor period
    pub heartbeat_timeout: Duration,
    pub retransmit_interval: Duration,
    pub ack_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for MeshTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            retransmit_interval: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
