//! Rooms, participants and ingest sessions hosted by this relay

mod egress;
mod error;
mod ingest;
mod join;
mod participant;
mod registry;
mod room;

pub use egress::run_participant;
pub use error::RelayError;
pub use ingest::run_ingest;
pub use join::{serve_room_connection, JOIN_TIMEOUT};
pub use participant::{random_name, Participant, PARTICIPANT_DATA_LABEL};
pub use registry::Relay;
pub use room::{Room, RoomState};
