//! Cross-relay signaling
//!
//! A relay hosting a room answers stream requests by opening a relay-to-relay
//! peer connection that carries the room's tracks plus a lossy data channel
//! for viewer input. SDP and ICE for those links, and for participants whose
//! stream lives on another relay, travel over the mesh.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::common::{ParticipantId, RelayId};
use crate::media::{
    DataChannel, DataChannelOptions, IceCandidate, PeerConnection, PeerEvent, PeerEvents, SdpKind,
    SessionDescription,
};
use crate::relay::Room;

use super::error::MeshError;
use super::manager::MeshManager;
use super::messages::MeshMessage;

/// Which end of a relay-to-relay connection this relay holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Hosts the room and sends its tracks
    Sender,
    /// Receives the tracks into a local copy of the room
    Receiver,
}

/// Media connection carrying one room between two relays
pub struct RelayLink {
    pub room: Arc<Room>,
    pub peer: RelayId,
    pub role: LinkRole,
    pub pc: Arc<dyn PeerConnection>,
    data_channel: Mutex<Option<Arc<dyn DataChannel>>>,
}

impl RelayLink {
    fn new(room: Arc<Room>, peer: RelayId, role: LinkRole, pc: Arc<dyn PeerConnection>) -> Self {
        Self {
            room,
            peer,
            role,
            pc,
            data_channel: Mutex::new(None),
        }
    }

    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.data_channel.lock().clone()
    }

    fn set_data_channel(&self, dc: Arc<dyn DataChannel>) {
        *self.data_channel.lock() = Some(dc);
    }
}

/// Label of the input data channel on a relay link
pub fn relay_data_label(room: &str) -> String {
    format!("relay-data-{}", room)
}

impl MeshManager {
    pub fn has_relay_link(&self, room: &str, peer: &RelayId) -> bool {
        self.relay_links.contains_key(&(room.to_string(), *peer))
    }

    pub fn relay_link(&self, room: &str, peer: &RelayId) -> Option<Arc<RelayLink>> {
        self.relay_links.get(&(room.to_string(), *peer))
    }

    pub fn relay_link_count(&self) -> usize {
        self.relay_links.len()
    }

    pub(super) fn close_relay_link(&self, room: &str, peer: &RelayId) {
        if let Some(link) = self.relay_links.remove(&(room.to_string(), *peer)) {
            spawn_close(link.pc.clone());
        }
    }

    pub(super) fn close_relay_links_with(&self, peer: &RelayId) {
        let links: Vec<Arc<RelayLink>> = self
            .relay_links
            .values()
            .into_iter()
            .filter(|link| link.peer == *peer)
            .collect();
        for link in links {
            self.close_relay_link(link.room.name(), peer);
        }
    }

    /// Start sending a hosted room to the requesting relay
    pub async fn handle_stream_request(self: &Arc<Self>, from: RelayId, room_name: &str) {
        let Some(relay) = self.relay() else { return };
        let Some(room) = relay.get_room_by_name(room_name) else {
            debug!("Stream request for unknown room {} from {}", room_name, from);
            return;
        };
        if !room.is_online() || self.is_remote_room(room_name) {
            debug!("Stream request for {} from {}: not hosted here", room_name, from);
            return;
        }
        if self.has_relay_link(room_name, &from) {
            debug!("Room {} already relayed to {}", room_name, from);
            return;
        }

        info!("Relaying room {} to relay {}", room_name, from);
        if let Err(e) = self.open_relay_link(room, from).await {
            warn!("Failed to relay room {} to {}: {}", room_name, from, e);
            self.close_relay_link(room_name, &from);
        }
    }

    async fn open_relay_link(self: &Arc<Self>, room: Arc<Room>, to: RelayId) -> Result<(), MeshError> {
        let relay = self.relay().ok_or(MeshError::RelayGone)?;
        let (pc, events) = relay
            .media()
            .create_peer_connection(&format!("nestri-{}", room.name()))
            .await?;

        let link = Arc::new(RelayLink::new(room.clone(), to, LinkRole::Sender, pc.clone()));
        self.relay_links
            .insert((room.name().to_string(), to), link.clone());

        for track in room.tracks() {
            pc.add_track(&track).await?;
        }
        let dc = pc
            .create_data_channel(
                &relay_data_label(room.name()),
                DataChannelOptions {
                    ordered: false,
                    max_retransmits: Some(0),
                },
            )
            .await?;
        link.set_data_channel(dc);

        tokio::spawn(self.clone().run_relay_link(link, events));

        let offer = pc.create_offer().await?;
        self.send_to(
            &to,
            &MeshMessage::ForwardSdp {
                room_name: Some(room.name().to_string()),
                participant_id: None,
                sdp: offer,
            },
        )
    }

    async fn run_relay_link(self: Arc<Self>, link: Arc<RelayLink>, mut events: PeerEvents) {
        let room_name = link.room.name().to_string();
        let input_label = relay_data_label(&room_name);

        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::IceCandidate(candidate) => {
                    let _ = self.send_to(
                        &link.peer,
                        &MeshMessage::ForwardIce {
                            room_name: Some(room_name.clone()),
                            participant_id: None,
                            candidate,
                        },
                    );
                }
                PeerEvent::Track(track) => link.room.set_track(track.kind(), Some(track)).await,
                PeerEvent::TrackEnded(kind) => link.room.set_track(kind, None).await,
                PeerEvent::DataChannel(dc) => {
                    debug!("Relay input channel for room {} opened", room_name);
                    link.set_data_channel(dc.clone());
                    link.room.set_data_channel(Some(dc));
                }
                PeerEvent::DataChannelMessage { label, data } if label == input_label => {
                    if let Err(e) = link.room.send_to_ingest(&data).await {
                        debug!("Dropped relayed input for room {}: {}", room_name, e);
                    }
                }
                PeerEvent::StateChanged(state) if state.is_terminal() => break,
                other => debug!("Relay link {} event: {:?}", room_name, other),
            }
        }

        let key = (room_name.clone(), link.peer);
        if self
            .relay_links
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(&current, &link))
        {
            self.relay_links.remove(&key);
        }
        let _ = link.pc.close().await;
        info!("Relay link for room {} with {} closed", room_name, link.peer);

        if link.role == LinkRole::Receiver {
            link.room.set_data_channel(None);
            link.room.mark_offline();
            if let Some(relay) = self.relay() {
                relay.delete_room_if_empty(&link.room);
            }
        }
    }

    pub async fn handle_forward_sdp(
        self: &Arc<Self>,
        from: RelayId,
        room_name: Option<String>,
        participant_id: Option<ParticipantId>,
        sdp: SessionDescription,
    ) {
        match (room_name, participant_id) {
            (_, Some(participant_id)) => self.apply_participant_sdp(participant_id, sdp).await,
            (Some(room), None) if sdp.kind == SdpKind::Offer => {
                if let Err(e) = self.accept_relay_offer(from, &room, sdp).await {
                    warn!("Failed to accept relayed room {} from {}: {}", room, from, e);
                    self.close_relay_link(&room, &from);
                }
            }
            (Some(room), None) => {
                let Some(link) = self.relay_link(&room, &from) else {
                    debug!("Answer for unknown relay link {} from {}", room, from);
                    return;
                };
                if let Err(e) = link.pc.set_remote_description(sdp).await {
                    warn!("Failed to apply relay answer for room {}: {}", room, e);
                }
            }
            (None, None) => warn!("Forwarded SDP from {} without a target", from),
        }
    }

    async fn accept_relay_offer(
        self: &Arc<Self>,
        from: RelayId,
        room_name: &str,
        offer: SessionDescription,
    ) -> Result<(), MeshError> {
        let relay = self.relay().ok_or(MeshError::RelayGone)?;
        self.close_relay_link(room_name, &from);

        let room = relay.get_or_create_room(room_name);
        let (pc, events) = relay
            .media()
            .create_peer_connection(&format!("relay-{}", room_name))
            .await?;
        let link = Arc::new(RelayLink::new(room, from, LinkRole::Receiver, pc.clone()));
        self.relay_links
            .insert((room_name.to_string(), from), link.clone());
        tokio::spawn(self.clone().run_relay_link(link, events));

        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer().await?;
        self.send_to(
            &from,
            &MeshMessage::ForwardSdp {
                room_name: Some(room_name.to_string()),
                participant_id: None,
                sdp: answer,
            },
        )?;
        info!("Receiving room {} from relay {}", room_name, from);
        Ok(())
    }

    async fn apply_participant_sdp(&self, participant_id: ParticipantId, sdp: SessionDescription) {
        let Some(participant) = self.relay().and_then(|r| r.get_participant_by_id(&participant_id))
        else {
            debug!("Forwarded SDP for unknown participant {}", participant_id);
            return;
        };
        if let Err(e) = participant.set_remote_description(sdp).await {
            warn!("Failed to apply forwarded SDP for {}: {}", participant_id, e);
        }
    }

    pub async fn handle_forward_ice(
        &self,
        from: RelayId,
        room_name: Option<String>,
        participant_id: Option<ParticipantId>,
        candidate: IceCandidate,
    ) {
        let result = match (room_name, participant_id) {
            (_, Some(participant_id)) => {
                match self.relay().and_then(|r| r.get_participant_by_id(&participant_id)) {
                    Some(participant) => participant.add_ice_candidate(candidate).await.map_err(MeshError::from),
                    None => {
                        debug!("Forwarded ICE for unknown participant {}", participant_id);
                        return;
                    }
                }
            }
            (Some(room), None) => match self.relay_link(&room, &from) {
                Some(link) => link.pc.add_ice_candidate(candidate).await.map_err(MeshError::from),
                None => {
                    debug!("ICE for unknown relay link {} from {}", room, from);
                    return;
                }
            },
            (None, None) => {
                warn!("Forwarded ICE from {} without a target", from);
                return;
            }
        };
        if let Err(e) = result {
            warn!("Failed to apply forwarded ICE from {}: {}", from, e);
        }
    }

    /// An ingest for one of our rooms reached another relay. If the room is
    /// not actually live here the claim is stale and is released so the
    /// ingest can take the room over.
    pub fn handle_forward_ingest(&self, from: RelayId, room_name: &str) {
        let live = self
            .relay()
            .and_then(|r| r.get_room_by_name(room_name))
            .is_some_and(|room| room.is_online());
        if live {
            info!("Relay {} forwarded an ingest for {}, which is live here", from, room_name);
        } else {
            info!("Releasing stale claim on room {} for ingest at {}", room_name, from);
            self.room_offline(room_name);
        }
    }
}

fn spawn_close(pc: Arc<dyn PeerConnection>) {
    tokio::spawn(async move {
        if let Err(e) = pc.close().await {
            debug!("Relay link close failed: {}", e);
        }
    });
}
