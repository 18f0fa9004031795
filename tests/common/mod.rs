//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use nestri_relay::common::{new_id, parse_public_key, KeyPair, MeshCipher, RelayId, RelayIdentity};
use nestri_relay::media::{
    DataChannel, DataChannelOptions, IceCandidate, MediaError, MediaTrack, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEvents, PeerState, SessionDescription, TrackKind,
};
use nestri_relay::mesh::{MeshError, MeshFrame, MeshMessage, MeshTimings};
use nestri_relay::transport::{Channel, Inbound, Inbox};
use nestri_relay::Relay;

/// Data channel that records what was sent through it
pub struct FakeDataChannel {
    label: String,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl FakeDataChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: &[u8]) -> Result<(), MediaError> {
        self.sent.lock().push(data.to_vec());
        Ok(())
    }
}

/// Peer connection with no network behind it. Tests drive it by emitting
/// events and inspect what the relay did to it.
pub struct FakePeer {
    stream_id: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    tracks: Mutex<Vec<MediaTrack>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    data_channels: Mutex<Vec<Arc<FakeDataChannel>>>,
    offers: Mutex<usize>,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn data_channel(&self, label: &str) -> Option<Arc<FakeDataChannel>> {
        self.data_channels
            .lock()
            .iter()
            .find(|dc| dc.label() == label)
            .cloned()
    }

    pub fn offer_count(&self) -> usize {
        *self.offers.lock()
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        *self.offers.lock() += 1;
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.stream_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.stream_id)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), MediaError> {
        self.tracks.lock().push(track.clone());
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _options: DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, MediaError> {
        let dc = FakeDataChannel::new(label);
        self.data_channels.lock().push(dc.clone());
        Ok(dc)
    }

    async fn close(&self) -> Result<(), MediaError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit(PeerEvent::StateChanged(PeerState::Closed));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory handing out `FakePeer`s and remembering them
#[derive(Default)]
pub struct FakeMedia {
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Most recent peer created for `stream_id`
    pub fn peer(&self, stream_id: &str) -> Option<Arc<FakePeer>> {
        self.peers
            .lock()
            .iter()
            .rev()
            .find(|p| p.stream_id == stream_id)
            .cloned()
    }

    pub fn peers_with_prefix(&self, prefix: &str) -> Vec<Arc<FakePeer>> {
        self.peers
            .lock()
            .iter()
            .filter(|p| p.stream_id.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeMedia {
    async fn create_peer_connection(
        &self,
        stream_id: &str,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), MediaError> {
        let (events, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(FakePeer {
            stream_id: stream_id.to_string(),
            events,
            tracks: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            offers: Mutex::new(0),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().push(peer.clone());
        Ok((peer, rx))
    }
}

pub fn track(kind: TrackKind) -> MediaTrack {
    MediaTrack::new(kind, kind.as_str(), Arc::new(()))
}

/// Relay with fake media and fast mesh timings
pub fn test_relay(media: Arc<FakeMedia>) -> Arc<Relay> {
    Relay::new(media, fast_timings())
}

pub fn fast_timings() -> MeshTimings {
    MeshTimings {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(200),
        retransmit_interval: Duration::from_millis(100),
        ack_timeout: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(2),
    }
}

/// Join `initiator` to `responder` over an in-memory channel
pub async fn connect(initiator: &Arc<Relay>, responder: &Arc<Relay>) -> Result<RelayId, MeshError> {
    let ((initiator_channel, initiator_inbox), (responder_channel, responder_inbox)) = Channel::pair();
    let responder_mesh = responder.mesh().clone();
    let accept = tokio::spawn(async move {
        responder_mesh
            .accept_connection(responder_channel, responder_inbox)
            .await
    });
    let result = initiator
        .mesh()
        .connect_channel(initiator_channel, initiator_inbox)
        .await;
    let _ = accept.await;
    result
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Hand-driven mesh peer: completes the handshake with a relay and then
/// sends and receives sealed messages exactly as the test says
pub struct ScriptedPeer {
    pub id: RelayId,
    channel: Arc<Channel>,
    inbox: Inbox,
    cipher: MeshCipher,
}

impl ScriptedPeer {
    /// Join `relay` as a fresh peer with no other peers of its own
    pub async fn join(relay: &Arc<Relay>) -> Self {
        let ((channel, mut inbox), (remote, remote_inbox)) = Channel::pair();
        let mesh = relay.mesh().clone();
        let accept = tokio::spawn(async move { mesh.accept_connection(remote, remote_inbox).await });

        let id = new_id();
        let keys = KeyPair::generate();
        let identity = RelayIdentity::generate();
        let hello = MeshFrame::Plain(MeshMessage::Handshake {
            relay_id: id,
            dh_public_key: keys.public_key_bytes().to_vec(),
            signing_key: identity.verifying_key_bytes().to_vec(),
        });
        channel.send_binary(hello.encode().unwrap()).unwrap();

        let reply = loop {
            match inbox.recv().await {
                Some(Inbound::Binary(bytes)) => break MeshFrame::decode(&bytes).unwrap(),
                Some(Inbound::Text(_)) => continue,
                None => panic!("relay closed the handshake"),
            }
        };
        let MeshFrame::Plain(MeshMessage::HandshakeResponse { dh_public_key, .. }) = reply else {
            panic!("expected a handshake response, got {:?}", reply);
        };
        let shared = keys.derive_shared_secret(&parse_public_key(&dh_public_key).unwrap());
        let cipher = MeshCipher::from_shared_secret(&shared).unwrap();
        accept.await.unwrap().expect("scripted peer admitted");

        Self {
            id,
            channel,
            inbox,
            cipher,
        }
    }

    pub fn send(&self, message: &MeshMessage) {
        let bytes = MeshFrame::seal(&self.cipher, message)
            .unwrap()
            .encode()
            .unwrap();
        self.channel.send_binary(bytes).unwrap();
    }

    /// Next message from the relay, or None once it hangs up or `within` passes
    pub async fn recv_within(&mut self, within: Duration) -> Option<MeshMessage> {
        let frame = tokio::time::timeout(within, async {
            loop {
                match self.inbox.recv().await {
                    Some(Inbound::Binary(bytes)) => return Some(bytes),
                    Some(Inbound::Text(_)) => continue,
                    None => return None,
                }
            }
        })
        .await
        .ok()??;
        Some(MeshFrame::decode(&frame).unwrap().open(&self.cipher).unwrap())
    }

    /// Skip messages until one satisfies `predicate`
    pub async fn recv_matching<F: Fn(&MeshMessage) -> bool>(&mut self, predicate: F) -> MeshMessage {
        loop {
            match self.recv_within(Duration::from_secs(5)).await {
                Some(message) if predicate(&message) => return message,
                Some(_) => continue,
                None => panic!("relay went quiet before the expected message"),
            }
        }
    }

    /// Everything received until `within` passes without a message
    pub async fn drain(&mut self, within: Duration) -> Vec<MeshMessage> {
        let mut received = Vec::new();
        while let Some(message) = self.recv_within(within).await {
            received.push(message);
        }
        received
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}
