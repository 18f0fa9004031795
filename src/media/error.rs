//! Media error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Peer connection closed")]
    Closed,

    #[error("Unsupported track: {0}")]
    UnsupportedTrack(String),

    #[error("Media setup failed: {0}")]
    Setup(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}
