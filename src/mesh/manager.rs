//! Mesh protocol engine
//!
//! Owns the peer directory and drives admission, state replication,
//! failure detection and eviction. The control plane is synchronous: channel
//! sends only enqueue, so broadcasting, acking and evicting never await and
//! can be called from any context, including each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::common::{
    parse_public_key, parse_verifying_key, KeyPair, MeshCipher, RelayId, RelayIdentity, SafeMap,
};
use crate::relay::Relay;
use crate::transport::{Channel, Inbound, Inbox, TransportError};

use super::approval::{count_valid_approvals, eviction_threshold, request_approvals, required_approvals};
use super::error::MeshError;
use super::forward::RelayLink;
use super::messages::{MeshFrame, MeshMessage};
use super::peer::{PeerRelay, PendingAcks};
use super::state::{MeshState, RoomEntity, StateTransition};
use super::MeshTimings;

pub struct MeshManager {
    relay_id: RelayId,
    relay: Weak<Relay>,
    identity: RelayIdentity,
    state: MeshState,
    peers: SafeMap<RelayId, PeerRelay>,
    pending_acks: PendingAcks,
    sequence: AtomicU64,
    pub(super) relay_links: SafeMap<(String, RelayId), Arc<RelayLink>>,
    timings: MeshTimings,
}

/// WebSocket URL of a peer's mesh endpoint
pub fn mesh_url(address: &str) -> String {
    if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else {
        format!("wss://{}/api/mesh", address)
    }
}

impl MeshManager {
    pub fn new(relay_id: RelayId, relay: Weak<Relay>, timings: MeshTimings) -> Self {
        Self {
            relay_id,
            relay,
            identity: RelayIdentity::generate(),
            state: MeshState::new(),
            peers: SafeMap::new(),
            pending_acks: PendingAcks::new(),
            sequence: AtomicU64::new(0),
            relay_links: SafeMap::new(),
            timings,
        }
    }

    pub fn relay_id(&self) -> RelayId {
        self.relay_id
    }

    pub fn state(&self) -> &MeshState {
        &self.state
    }

    pub fn pending_acks(&self) -> &PendingAcks {
        &self.pending_acks
    }

    pub fn timings(&self) -> &MeshTimings {
        &self.timings
    }

    pub(super) fn relay(&self) -> Option<Arc<Relay>> {
        self.relay.upgrade()
    }

    pub fn peer_ids(&self) -> Vec<RelayId> {
        self.peers.keys()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_connected(&self, relay_id: &RelayId) -> bool {
        self.peers.contains_key(relay_id)
    }

    /// Last sequence number issued by this relay
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn last_sequence_from(&self, relay_id: &RelayId) -> Option<u64> {
        self.peers.get(relay_id).map(|p| p.last_sequence)
    }

    pub fn suspect_count(&self, relay_id: &RelayId) -> Option<u32> {
        self.peers.get(relay_id).map(|p| p.suspect_count)
    }

    /// Launch the heartbeat sender, heartbeat monitor and retransmit sweep
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_periodic(
                "heartbeat",
                self.timings.heartbeat_interval,
                shutdown.clone(),
                MeshManager::send_heartbeats,
            ),
            self.spawn_periodic(
                "heartbeat monitor",
                self.timings.heartbeat_timeout,
                shutdown.clone(),
                MeshManager::check_heartbeats,
            ),
            self.spawn_periodic(
                "retransmit",
                self.timings.retransmit_interval,
                shutdown,
                MeshManager::retransmit_unacked,
            ),
        ]
    }

    fn spawn_periodic(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        tick: fn(&MeshManager),
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        tick(&manager);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Mesh {} loop stopped", name);
        })
    }

    // ---- admission ----

    /// Dial a peer relay and join it into the mesh
    pub async fn connect_to_relay(self: &Arc<Self>, address: &str) -> Result<RelayId, MeshError> {
        let url = mesh_url(address);
        info!("Connecting to relay at {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| MeshError::Connect(url.clone(), e.to_string()))?;
        let (channel, inbox) = Channel::spawn(ws_stream, url);
        self.connect_channel(channel, inbox).await
    }

    /// Run the initiator side of the handshake over an open channel
    pub async fn connect_channel(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        mut inbox: Inbox,
    ) -> Result<RelayId, MeshError> {
        match self.initiate(&channel, &mut inbox).await {
            Ok((peer_id, cipher, signing_key)) => {
                self.admit(peer_id, channel, cipher, signing_key, inbox);
                Ok(peer_id)
            }
            Err(e) => {
                warn!("Mesh handshake with {} failed: {}", channel.remote(), e);
                channel.close();
                Err(e)
            }
        }
    }

    async fn initiate(
        &self,
        channel: &Channel,
        inbox: &mut Inbox,
    ) -> Result<(RelayId, MeshCipher, ed25519_dalek::VerifyingKey), MeshError> {
        let keys = KeyPair::generate();
        let hello = MeshFrame::Plain(MeshMessage::Handshake {
            relay_id: self.relay_id,
            dh_public_key: keys.public_key_bytes().to_vec(),
            signing_key: self.identity.verifying_key_bytes().to_vec(),
        });
        channel.send_binary(hello.encode()?)?;

        let (peer_id, dh_public_key, signing_key, approvals) =
            match recv_plain(inbox, self.timings.handshake_timeout).await? {
                MeshMessage::HandshakeResponse {
                    relay_id,
                    dh_public_key,
                    signing_key,
                    approvals,
                } => (relay_id, dh_public_key, signing_key, approvals),
                MeshMessage::Disconnect { relay_id, reason } => {
                    return Err(MeshError::Refused { relay_id, reason })
                }
                other => return Err(MeshError::UnexpectedMessage(other.kind())),
            };

        if peer_id == self.relay_id {
            return Err(MeshError::SelfConnection);
        }
        if self.peers.contains_key(&peer_id) {
            return Err(MeshError::AlreadyConnected(peer_id));
        }

        let responder_key = parse_verifying_key(&signing_key)?;
        let known: HashMap<RelayId, _> = self
            .peers
            .values()
            .into_iter()
            .map(|p| (p.id, p.signing_key))
            .collect();
        let required = required_approvals(known.len());
        if required > 0 {
            let valid = count_valid_approvals(&approvals, &self.relay_id, &responder_key, &known);
            if valid < required {
                return Err(MeshError::AdmissionRejected { valid, required });
            }
            debug!("Admission approved with {}/{} signatures", valid, required);
        }

        let shared = keys.derive_shared_secret(&parse_public_key(&dh_public_key)?);
        let cipher = MeshCipher::from_shared_secret(&shared)?;
        Ok((peer_id, cipher, responder_key))
    }

    /// Run the responder side of the handshake for an inbound mesh channel
    pub async fn accept_connection(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        mut inbox: Inbox,
    ) -> Result<RelayId, MeshError> {
        match self.respond(&channel, &mut inbox).await {
            Ok((peer_id, cipher, signing_key)) => {
                self.admit(peer_id, channel, cipher, signing_key, inbox);
                Ok(peer_id)
            }
            Err(e) => {
                warn!("Rejected mesh connection from {}: {}", channel.remote(), e);
                if matches!(e, MeshError::AlreadyConnected(_) | MeshError::SelfConnection) {
                    // Plain refusal naming this relay, flushed before the close
                    let refusal = MeshFrame::Plain(MeshMessage::Disconnect {
                        relay_id: self.relay_id,
                        reason: e.to_string(),
                    });
                    if let Ok(bytes) = refusal.encode() {
                        let _ = channel.send_binary(bytes);
                    }
                }
                channel.close();
                Err(e)
            }
        }
    }

    async fn respond(
        &self,
        channel: &Channel,
        inbox: &mut Inbox,
    ) -> Result<(RelayId, MeshCipher, ed25519_dalek::VerifyingKey), MeshError> {
        let hello = recv_plain(inbox, self.timings.handshake_timeout).await?;
        let MeshMessage::Handshake {
            relay_id: peer_id,
            dh_public_key,
            signing_key,
        } = hello
        else {
            return Err(MeshError::UnexpectedMessage(hello.kind()));
        };

        if peer_id == self.relay_id {
            return Err(MeshError::SelfConnection);
        }
        if self.peers.contains_key(&peer_id) {
            return Err(MeshError::AlreadyConnected(peer_id));
        }
        let peer_key = parse_verifying_key(&signing_key)?;
        let peer_public = parse_public_key(&dh_public_key)?;

        let keys = KeyPair::generate();
        let public = keys.public_key_bytes();
        let cipher = MeshCipher::from_shared_secret(&keys.derive_shared_secret(&peer_public))?;
        let approvals = request_approvals(&self.identity, &peer_id, &self.peers.keys());

        let reply = MeshFrame::Plain(MeshMessage::HandshakeResponse {
            relay_id: self.relay_id,
            dh_public_key: public.to_vec(),
            signing_key: self.identity.verifying_key_bytes().to_vec(),
            approvals,
        });
        channel.send_binary(reply.encode()?)?;
        Ok((peer_id, cipher, peer_key))
    }

    fn admit(
        self: &Arc<Self>,
        peer_id: RelayId,
        channel: Arc<Channel>,
        cipher: MeshCipher,
        signing_key: ed25519_dalek::VerifyingKey,
        inbox: Inbox,
    ) {
        let peer = PeerRelay::new(peer_id, channel.clone(), cipher, signing_key);
        let cipher = peer.cipher.clone();
        self.peers.insert(peer_id, peer);
        info!("Relay {} admitted to mesh ({} peers)", peer_id, self.peers.len());

        tokio::spawn(self.clone().run_peer(peer_id, channel, cipher, inbox));

        self.broadcast_state_update();
        self.rescan_active_rooms();
    }

    /// Ask the mesh for every active remote room that is not online here
    fn rescan_active_rooms(&self) {
        let Some(relay) = self.relay() else { return };
        for (room, owner) in self.state.active_rooms() {
            if owner == self.relay_id {
                continue;
            }
            let online = relay.get_room_by_name(&room).is_some_and(|r| r.is_online());
            if !online {
                self.request_stream(&room);
            }
        }
    }

    async fn run_peer(
        self: Arc<Self>,
        peer_id: RelayId,
        channel: Arc<Channel>,
        cipher: Arc<MeshCipher>,
        mut inbox: Inbox,
    ) {
        while let Some(inbound) = inbox.recv().await {
            let bytes = match inbound {
                Inbound::Binary(bytes) => bytes,
                Inbound::Text(_) => {
                    debug!("Ignoring text frame from relay {}", peer_id);
                    continue;
                }
            };
            let message = match MeshFrame::decode(&bytes).and_then(|f| f.open(&cipher)) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping message from relay {}: {}", peer_id, e);
                    continue;
                }
            };
            self.handle_message(peer_id, message).await;
        }

        let current = self
            .peers
            .get(&peer_id)
            .is_some_and(|p| Arc::ptr_eq(&p.channel, &channel));
        if current {
            self.remove_relay(peer_id, "connection closed");
        }
    }

    async fn handle_message(self: &Arc<Self>, from: RelayId, message: MeshMessage) {
        match message {
            MeshMessage::StateUpdate { sequence, entities } => {
                self.handle_state_update(from, sequence, entities)
            }
            MeshMessage::Ack { sequence, .. } => self.handle_ack(from, sequence),
            MeshMessage::Heartbeat { .. } => self.handle_heartbeat(from),
            MeshMessage::SuspectRelay { relay_id, reason } => {
                self.handle_suspect(from, relay_id, &reason)
            }
            MeshMessage::Disconnect { relay_id, reason } => {
                if relay_id != self.relay_id {
                    self.remove_relay(relay_id, &format!("disconnect from {}: {}", from, reason));
                }
            }
            MeshMessage::ForwardSdp {
                room_name,
                participant_id,
                sdp,
            } => {
                self.handle_forward_sdp(from, room_name, participant_id, sdp)
                    .await
            }
            MeshMessage::ForwardIce {
                room_name,
                participant_id,
                candidate,
            } => {
                self.handle_forward_ice(from, room_name, participant_id, candidate)
                    .await
            }
            MeshMessage::ForwardIngest { room_name } => self.handle_forward_ingest(from, &room_name),
            MeshMessage::StreamRequest { room_name } => {
                self.handle_stream_request(from, &room_name).await
            }
            other @ (MeshMessage::Handshake { .. } | MeshMessage::HandshakeResponse { .. }) => {
                warn!("Unexpected {} from admitted relay {}", other.kind(), from);
            }
        }
    }

    // ---- sending ----

    /// Send to one peer; a transport failure evicts it
    pub fn send_to(&self, relay_id: &RelayId, message: &MeshMessage) -> Result<(), MeshError> {
        let peer = self
            .peers
            .get(relay_id)
            .ok_or(MeshError::UnknownRelay(*relay_id))?;
        let bytes = MeshFrame::seal(&peer.cipher, message)?.encode()?;

        if let Err(e) = peer.channel.send_binary(bytes) {
            self.remove_relay(*relay_id, &format!("send of {} failed", message.kind()));
            return Err(e.into());
        }
        Ok(())
    }

    /// Send to every peer, returning how many sends succeeded
    pub fn broadcast(&self, message: &MeshMessage) -> usize {
        self.peers
            .keys()
            .iter()
            .filter(|id| self.send_to(id, message).is_ok())
            .count()
    }

    // ---- state replication ----

    /// Send the full ownership snapshot under a new sequence number.
    /// Nothing is sent, and no sequence is used, while there are no peers.
    pub fn broadcast_state_update(&self) -> Option<u64> {
        let recipients = self.peers.keys();
        if recipients.is_empty() {
            return None;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending_acks
            .record(sequence, recipients.iter().copied(), Instant::now());

        let message = MeshMessage::StateUpdate {
            sequence,
            entities: self.state.snapshot(),
        };
        for id in &recipients {
            let _ = self.send_to(id, &message);
        }
        debug!("Broadcast state update {} to {} relays", sequence, recipients.len());
        Some(sequence)
    }

    pub fn handle_state_update(
        &self,
        from: RelayId,
        sequence: u64,
        entities: HashMap<String, RoomEntity>,
    ) {
        let fresh = self.peers.update(&from, |peer| {
            if sequence > peer.last_sequence {
                peer.last_sequence = sequence;
                true
            } else {
                false
            }
        });
        match fresh {
            None => return,
            Some(false) => {
                // Already applied; re-ack in case the first ack was lost
                let _ = self.send_to(&from, &self.ack(sequence));
                return;
            }
            Some(true) => {}
        }

        let transitions: Vec<StateTransition> = entities
            .into_iter()
            .filter_map(|(room, entity)| self.apply_entity(&room, entity))
            .collect();
        let _ = self.send_to(&from, &self.ack(sequence));

        for transition in transitions {
            self.handle_transition(transition);
        }
    }

    fn ack(&self, sequence: u64) -> MeshMessage {
        MeshMessage::Ack {
            relay_id: self.relay_id,
            sequence,
        }
    }

    /// Rooms owned by this relay are only changed locally
    fn apply_entity(&self, room: &str, entity: RoomEntity) -> Option<StateTransition> {
        if entity.owner == self.relay_id {
            return None;
        }
        if self.state.active_owner(room) == Some(self.relay_id) {
            return None;
        }
        if entity.active {
            self.state.activate(room, entity.owner)
        } else if self.state.active_owner(room) == Some(entity.owner) {
            self.state.deactivate(room)
        } else {
            None
        }
    }

    pub fn handle_ack(&self, from: RelayId, sequence: u64) {
        if self.pending_acks.ack(sequence, &from) {
            debug!("Relay {} acked state {}", from, sequence);
        }
    }

    /// Resend the current snapshot to peers that have not acked in time
    pub fn retransmit_unacked(&self) {
        let now = Instant::now();
        let overdue = self.pending_acks.overdue(self.timings.ack_timeout, now);
        if overdue.is_empty() {
            return;
        }

        let entities = self.state.snapshot();
        for (sequence, relay_id) in overdue {
            if !self.peers.contains_key(&relay_id) {
                self.pending_acks.forget_peer(&relay_id);
                continue;
            }
            debug!("Retransmitting state {} to relay {}", sequence, relay_id);
            let message = MeshMessage::StateUpdate {
                sequence,
                entities: entities.clone(),
            };
            if self.send_to(&relay_id, &message).is_ok() {
                self.pending_acks.refresh(sequence, &relay_id, now);
            }
        }
    }

    // ---- failure detection ----

    pub fn send_heartbeats(&self) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(as_millis_saturating)
            .unwrap_or_default();
        self.broadcast(&MeshMessage::Heartbeat {
            relay_id: self.relay_id,
            timestamp,
        });
    }

    pub fn handle_heartbeat(&self, from: RelayId) {
        self.peers.update(&from, |peer| {
            peer.last_heartbeat = Instant::now();
            peer.suspect_count = 0;
        });
    }

    /// Suspect every peer silent for longer than the heartbeat timeout
    pub fn check_heartbeats(&self) {
        let now = Instant::now();
        let timeout = self.timings.heartbeat_timeout;
        let silent: Vec<RelayId> = self
            .peers
            .values()
            .into_iter()
            .filter(|p| now.duration_since(p.last_heartbeat) > timeout)
            .map(|p| p.id)
            .collect();

        for relay_id in silent {
            warn!("Relay {} missed heartbeats", relay_id);
            self.suspect(relay_id, "heartbeat timeout", true);
        }
    }

    pub fn handle_suspect(&self, from: RelayId, relay_id: RelayId, reason: &str) {
        if relay_id == self.relay_id {
            debug!("Relay {} suspects us: {}", from, reason);
            return;
        }
        self.suspect(relay_id, reason, false);
    }

    fn suspect(&self, relay_id: RelayId, reason: &str, gossip: bool) {
        let Some(count) = self.peers.update(&relay_id, |peer| {
            peer.suspect_count += 1;
            peer.suspect_count
        }) else {
            return;
        };

        if gossip {
            self.broadcast(&MeshMessage::SuspectRelay {
                relay_id,
                reason: reason.to_string(),
            });
        }

        let threshold = eviction_threshold(self.peers.len());
        warn!(
            "Relay {} suspected ({}/{}): {}",
            relay_id, count, threshold, reason
        );
        if count >= threshold {
            self.broadcast(&MeshMessage::Disconnect {
                relay_id,
                reason: reason.to_string(),
            });
            self.remove_relay(relay_id, reason);
        }
    }

    /// Evict a peer and release every room it owned
    pub fn remove_relay(&self, relay_id: RelayId, reason: &str) {
        let Some(peer) = self.peers.remove(&relay_id) else {
            return;
        };
        warn!("Evicting relay {}: {}", relay_id, reason);
        peer.channel.close();
        self.pending_acks.forget_peer(&relay_id);
        self.close_relay_links_with(&relay_id);

        for room in self.state.rooms_owned_by(&relay_id) {
            if let Some(transition) = self.state.deactivate(&room) {
                self.handle_transition(transition);
            }
        }
        self.broadcast_state_update();
    }

    // ---- room ownership ----

    fn handle_transition(&self, transition: StateTransition) {
        let Some(relay) = self.relay() else { return };
        match transition {
            StateTransition::Activated { room, owner } if owner != self.relay_id => {
                info!("Room {} is active on relay {}", room, owner);
                let local = relay.get_or_create_room(&room);
                if !local.is_online() {
                    self.request_stream(&room);
                }
            }
            StateTransition::Activated { .. } => {}
            StateTransition::Deactivated { room, owner } => {
                info!("Room {} went offline on relay {}", room, owner);
                self.close_relay_link(&room, &owner);
                if let Some(local) = relay.get_room_by_name(&room) {
                    local.mark_offline();
                    relay.delete_room_if_empty(&local);
                }
            }
        }
    }

    /// Claim a room whose ingest is live here. Rooms relayed from their
    /// owner are never claimed.
    pub fn room_online(&self, room: &str) {
        if self
            .state
            .active_owner(room)
            .is_some_and(|owner| owner != self.relay_id)
        {
            debug!("Room {} online as a relayed copy", room);
            return;
        }
        if self.state.activate(room, self.relay_id).is_some() {
            info!("Room {} is now hosted here", room);
            self.broadcast_state_update();
        }
    }

    /// Release a room this relay owns
    pub fn room_offline(&self, room: &str) {
        if self.state.active_owner(room) != Some(self.relay_id) {
            return;
        }
        if self.state.deactivate(room).is_some() {
            info!("Room {} is no longer hosted here", room);
            self.broadcast_state_update();
        }
    }

    /// True when the room is active and owned by another relay
    pub fn is_remote_room(&self, room: &str) -> bool {
        self.state
            .active_owner(room)
            .is_some_and(|owner| owner != self.relay_id)
    }

    pub fn request_stream(&self, room: &str) {
        let sent = self.broadcast(&MeshMessage::StreamRequest {
            room_name: room.to_string(),
        });
        debug!("Requested stream for room {} from {} relays", room, sent);
    }

    /// Tell the owner of a room that an ingest for it arrived here
    pub fn forward_ingest(&self, owner: &RelayId, room: &str) -> Result<(), MeshError> {
        self.send_to(
            owner,
            &MeshMessage::ForwardIngest {
                room_name: room.to_string(),
            },
        )
    }
}

fn as_millis_saturating(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Next plain frame during the handshake
async fn recv_plain(inbox: &mut Inbox, timeout: Duration) -> Result<MeshMessage, MeshError> {
    let bytes = tokio::time::timeout(timeout, async {
        loop {
            match inbox.recv().await {
                Some(Inbound::Binary(bytes)) => return Some(bytes),
                Some(Inbound::Text(_)) => continue,
                None => return None,
            }
        }
    })
    .await
    .map_err(|_| MeshError::HandshakeTimeout)?
    .ok_or(MeshError::Transport(TransportError::Closed))?;

    match MeshFrame::decode(&bytes)? {
        MeshFrame::Plain(message) => Ok(message),
        MeshFrame::Sealed { .. } => Err(MeshError::UnexpectedMessage("sealed frame")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_url() {
        assert_eq!(mesh_url("relay-b:8088"), "wss://relay-b:8088/api/mesh");
        assert_eq!(
            mesh_url("ws://127.0.0.1:9000/api/mesh"),
            "ws://127.0.0.1:9000/api/mesh"
        );
    }

    #[test]
    fn test_heartbeat_millis_saturate() {
        assert_eq!(as_millis_saturating(Duration::from_secs(2)), 2000);
        assert_eq!(as_millis_saturating(Duration::MAX), u64::MAX);
    }
}
