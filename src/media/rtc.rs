//! webrtc-rs backend
//!
//! Every inbound RTP track gets a pump task that copies packets into a local
//! static track until the remote track ends or the connection closes.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::common::flag_raised;

use super::{
    DataChannel, DataChannelOptions, IceCandidate, MediaError, MediaTrack, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEvents, PeerState, SdpKind, SessionDescription,
    TrackKind,
};

/// Network settings for the WebRTC stack
#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub udp_port_start: u16,
    pub udp_port_end: u16,
    pub stun_server: String,
    /// Public addresses advertised as host candidates
    pub nat_ips: Vec<String>,
}

pub struct WebRtcFactory {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcFactory {
    pub fn new(settings: &MediaSettings) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        let ephemeral = EphemeralUDP::new(settings.udp_port_start, settings.udp_port_end)
            .map_err(|e| MediaError::Setup(format!("UDP port range: {}", e)))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        if !settings.nat_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(settings.nat_ips.clone(), RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![format!("stun:{}", settings.stun_server)],
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create_peer_connection(
        &self,
        stream_id: &str,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), MediaError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        install_handlers(&pc, stream_id, &events_tx, &closed);

        let peer = WebRtcPeer {
            pc,
            events: events_tx,
            closed,
            pending_candidates: Mutex::new(Vec::new()),
        };
        Ok((Arc::new(peer), events_rx))
    }
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    stream_id: &str,
    events: &mpsc::UnboundedSender<PeerEvent>,
    closed: &Arc<watch::Sender<bool>>,
) {
    let ice_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = ice_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(PeerEvent::IceCandidate(from_init(init)));
                }
                Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
            }
        })
    }));

    let state_events = events.clone();
    let state_closed = closed.clone();
    let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let state = map_state(s);
        debug!("Peer connection state changed: {}", s);
        let _ = state_events.send(PeerEvent::StateChanged(state));
        if state.is_terminal() {
            state_closed.send_replace(true);
            // close() re-enters this callback, so it must not run inline
            if let Some(pc) = weak_pc.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = pc.close().await {
                        debug!("Peer connection close failed: {}", e);
                    }
                });
            }
        }
        Box::pin(async {})
    }));

    let track_events = events.clone();
    let track_closed = closed.clone();
    let stream_id = stream_id.to_string();
    pc.on_track(Box::new(
        move |remote: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            mirror_track(remote, &stream_id, &track_events, &track_closed);
            Box::pin(async {})
        },
    ));

    let dc_events = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let events = dc_events.clone();
        Box::pin(async move {
            debug!("Remote data channel opened: {}", dc.label());
            forward_messages(&dc, events.clone());
            let _ = events.send(PeerEvent::DataChannel(Arc::new(WebRtcDataChannel::new(dc))));
        })
    }));
}

fn mirror_track(
    remote: Arc<TrackRemote>,
    stream_id: &str,
    events: &mpsc::UnboundedSender<PeerEvent>,
    closed: &Arc<watch::Sender<bool>>,
) {
    let kind = match remote.kind() {
        RTPCodecType::Audio => TrackKind::Audio,
        RTPCodecType::Video => TrackKind::Video,
        other => {
            warn!("Ignoring inbound track of kind {}", other);
            return;
        }
    };

    let local = Arc::new(TrackLocalStaticRTP::new(
        remote.codec().capability,
        kind.as_str().to_string(),
        stream_id.to_string(),
    ));
    debug!("Received {} track for stream {}", kind, stream_id);

    let track = MediaTrack::new(kind, local.id().to_string(), local.clone());
    let _ = events.send(PeerEvent::Track(track));

    tokio::spawn(pump_rtp(remote, local, kind, events.clone(), closed.subscribe()));
}

/// Copy RTP from a remote track into its local mirror
async fn pump_rtp(
    remote: Arc<TrackRemote>,
    local: Arc<TrackLocalStaticRTP>,
    kind: TrackKind,
    events: mpsc::UnboundedSender<PeerEvent>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = remote.read_rtp() => match result {
                Ok((packet, _)) => {
                    if let Err(e) = local.write_rtp(&packet).await {
                        debug!("Dropped {} RTP packet: {}", kind, e);
                    }
                }
                Err(e) => {
                    debug!("{} track ended: {}", kind, e);
                    break;
                }
            },
            _ = flag_raised(&mut closed) => break,
        }
    }
    let _ = events.send(PeerEvent::TrackEnded(kind));
}

fn forward_messages(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerEvent>) {
    let label = dc.label().to_string();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = events.send(PeerEvent::DataChannelMessage {
            label: label.clone(),
            data: msg.data.to_vec(),
        });
        Box::pin(async {})
    }));
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    closed: Arc<watch::Sender<bool>>,
    pending_candidates: Mutex<Vec<IceCandidate>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let desc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        self.pc.set_remote_description(desc).await?;

        let held = std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in held {
            self.pc.add_ice_candidate(to_init(candidate)).await?;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        if self.pc.remote_description().await.is_none() {
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }
        self.pc.add_ice_candidate(to_init(candidate)).await?;
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), MediaError> {
        let local = track
            .handle()
            .downcast::<TrackLocalStaticRTP>()
            .map_err(|_| MediaError::UnsupportedTrack(track.id().to_string()))?;
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        options: DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, MediaError> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_retransmits: options.max_retransmits,
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;

        forward_messages(&dc, self.events.clone());
        let events = self.events.clone();
        let open_label = label.to_string();
        dc.on_open(Box::new(move || {
            let _ = events.send(PeerEvent::DataChannelOpen(open_label.clone()));
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcDataChannel::new(dc)))
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.closed.send_replace(true);
        self.pc.close().await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

struct WebRtcDataChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self {
            label: dc.label().to_string(),
            dc,
        }
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: &[u8]) -> Result<(), MediaError> {
        self.dc.send(&Bytes::copy_from_slice(data)).await?;
        Ok(())
    }
}
