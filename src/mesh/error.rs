//! Mesh error types

use thiserror::Error;

use crate::common::{CryptoError, RelayId};
use crate::media::MediaError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Connect to {0} failed: {1}")]
    Connect(String, String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Unexpected {0} during handshake")]
    UnexpectedMessage(&'static str),

    #[error("Unsealed {0} frame from admitted relay")]
    UnsealedFrame(&'static str),

    #[error("Relay {0} is already connected")]
    AlreadyConnected(RelayId),

    #[error("Relay {relay_id} refused the handshake: {reason}")]
    Refused { relay_id: RelayId, reason: String },

    #[error("Refusing to connect to self")]
    SelfConnection,

    #[error("Admission rejected: {valid} valid approvals, {required} required")]
    AdmissionRejected { valid: usize, required: usize },

    #[error("Unknown relay {0}")]
    UnknownRelay(RelayId),

    #[error("Relay is shutting down")]
    RelayGone,
}
