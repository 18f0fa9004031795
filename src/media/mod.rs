//! WebRTC media plane
//!
//! Rooms and participants talk to peer connections through the
//! [`PeerConnection`] trait; [`WebRtcFactory`] is the production backend.
//! Callbacks from the underlying stack are turned into [`PeerEvent`]s on an
//! unbounded queue owned by whoever created the connection.

mod error;
mod rtc;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use rtc::{MediaSettings, WebRtcFactory};
pub use error::MediaError;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description in the browser JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

/// Handle to a local outbound track that can be attached to peer connections
#[derive(Clone)]
pub struct MediaTrack {
    kind: TrackKind,
    id: String,
    handle: Arc<dyn Any + Send + Sync>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>, handle: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            kind,
            id: id.into(),
            handle,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Backend-specific track object
    pub fn handle(&self) -> Arc<dyn Any + Send + Sync> {
        self.handle.clone()
    }

    /// True when both handles refer to the same underlying track
    pub fn same_as(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

/// Peer connection lifecycle as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States after which the connection is torn down
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

/// Data channel delivery options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChannelOptions {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, data: &[u8]) -> Result<(), MediaError>;
}

/// Events raised by a peer connection
pub enum PeerEvent {
    /// Local ICE candidate to signal to the remote side
    IceCandidate(IceCandidate),
    /// Inbound remote track, already mirrored into a local track
    Track(MediaTrack),
    /// The RTP pump of an inbound track stopped
    TrackEnded(TrackKind),
    /// Data channel opened by the remote side
    DataChannel(Arc<dyn DataChannel>),
    /// Locally created data channel finished opening
    DataChannelOpen(String),
    DataChannelMessage { label: String, data: Vec<u8> },
    StateChanged(PeerState),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            PeerEvent::Track(t) => f.debug_tuple("Track").field(t).finish(),
            PeerEvent::TrackEnded(k) => f.debug_tuple("TrackEnded").field(k).finish(),
            PeerEvent::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            PeerEvent::DataChannelOpen(label) => f.debug_tuple("DataChannelOpen").field(label).finish(),
            PeerEvent::DataChannelMessage { label, data } => f
                .debug_struct("DataChannelMessage")
                .field("label", label)
                .field("len", &data.len())
                .finish(),
            PeerEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// Event queue of one peer connection
pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// A negotiated WebRTC peer connection.
///
/// Remote ICE candidates received before the remote description are held by
/// the implementation and applied once it is set.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Create an answer and install it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Attach a local track. Incoming RTCP for its sender is drained in the
    /// background so the sender never stalls.
    async fn add_track(&self, track: &MediaTrack) -> Result<(), MediaError>;

    async fn create_data_channel(
        &self,
        label: &str,
        options: DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, MediaError>;

    async fn close(&self) -> Result<(), MediaError>;

    fn is_closed(&self) -> bool;
}

/// Creates peer connections; `stream_id` names the local tracks mirrored
/// from inbound media.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        stream_id: &str,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), MediaError>;
}
