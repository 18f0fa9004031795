//! Relay error types

use thiserror::Error;

use crate::media::MediaError;
use crate::mesh::MeshError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("No peer connection")]
    NoPeerConnection,

    #[error("No data channel")]
    NoDataChannel,

    #[error("Timed out waiting for join")]
    JoinTimeout,

    #[error("Channel closed before join")]
    ClosedBeforeJoin,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),
}
