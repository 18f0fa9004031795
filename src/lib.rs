//! nestri-relay - WebRTC stream relay with a federated relay mesh
//!
//! A relay accepts one ingest per room and fans its audio and video out to
//! viewers. Relays join into a mesh, agree on which relay hosts which room
//! and pull streams from each other so viewers can connect anywhere.

pub mod common;
pub mod config;
pub mod media;
pub mod mesh;
pub mod relay;
pub mod server;
pub mod transport;

pub use config::RelayConfig;
pub use mesh::{MeshManager, MeshTimings};
pub use relay::{Participant, Relay, Room};
pub use server::EndpointServer;
