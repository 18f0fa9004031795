//! Transport channels and the client-facing message protocol

mod channel;
mod error;
mod messages;

pub use channel::{Channel, Inbound, Inbox};
pub use error::TransportError;
pub use messages::{AnswerType, ClientMessage, ControlCommand, ControlReply, JoinerType};
