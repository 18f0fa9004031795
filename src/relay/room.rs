//! Rooms
//!
//! A room is named stream content. It is online exactly when both an audio
//! and a video track are present, whether they come from a local ingest or
//! from a relay link. Crossing that line in either direction updates the
//! mesh and signals every participant.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::common::{new_id, ParticipantId, RoomId, SafeMap};
use crate::media::{DataChannel, MediaTrack, PeerConnection, TrackKind};
use crate::transport::{AnswerType, Channel};

use super::error::RelayError;
use super::participant::Participant;
use super::registry::Relay;

/// Lifecycle of a room as seen from this relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Nothing attached
    Empty,
    /// Ingest or a relay link attached, tracks still arriving
    Configuring,
    Online,
    /// Was online, lost a track
    Offline,
}

#[derive(Default)]
struct RoomInner {
    audio: Option<MediaTrack>,
    video: Option<MediaTrack>,
    online: bool,
    was_online: bool,
    ingest: Option<Arc<Channel>>,
    ingest_pc: Option<Arc<dyn PeerConnection>>,
    data_channel: Option<Arc<dyn DataChannel>>,
}

impl RoomInner {
    fn slot(&mut self, kind: TrackKind) -> &mut Option<MediaTrack> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }

    fn has_both(&self) -> bool {
        self.audio.is_some() && self.video.is_some()
    }
}

enum TrackChange {
    Unchanged,
    WentOnline,
    WentOffline,
    Replaced(MediaTrack),
}

pub struct Room {
    id: RoomId,
    name: String,
    relay: Weak<Relay>,
    inner: Mutex<RoomInner>,
    participants: SafeMap<ParticipantId, Arc<Participant>>,
}

impl Room {
    pub fn new(name: &str, relay: Weak<Relay>) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            relay,
            inner: Mutex::new(RoomInner::default()),
            participants: SafeMap::new(),
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().online
    }

    pub fn state(&self) -> RoomState {
        let inner = self.inner.lock();
        if inner.online {
            RoomState::Online
        } else if inner.ingest.is_some() || inner.audio.is_some() || inner.video.is_some() {
            RoomState::Configuring
        } else if inner.was_online {
            RoomState::Offline
        } else {
            RoomState::Empty
        }
    }

    /// Current tracks, audio first
    pub fn tracks(&self) -> Vec<MediaTrack> {
        let inner = self.inner.lock();
        inner.audio.iter().chain(inner.video.iter()).cloned().collect()
    }

    pub fn track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.inner.lock().slot(kind).clone()
    }

    /// Install or clear a track. Setting the same track twice is a no-op.
    pub async fn set_track(&self, kind: TrackKind, track: Option<MediaTrack>) {
        let change = {
            let mut inner = self.inner.lock();
            let slot = inner.slot(kind);
            let same = match (slot.as_ref(), track.as_ref()) {
                (None, None) => true,
                (Some(a), Some(b)) => a.same_as(b),
                _ => false,
            };
            if same {
                TrackChange::Unchanged
            } else {
                *slot = track.clone();
                let now_online = inner.has_both();
                match (inner.online, now_online) {
                    (false, true) => {
                        inner.online = true;
                        inner.was_online = true;
                        TrackChange::WentOnline
                    }
                    (true, false) => {
                        inner.online = false;
                        TrackChange::WentOffline
                    }
                    (true, true) => match track {
                        Some(track) => TrackChange::Replaced(track),
                        None => TrackChange::Unchanged,
                    },
                    (false, false) => TrackChange::Unchanged,
                }
            }
        };

        match change {
            TrackChange::Unchanged => {}
            TrackChange::WentOnline => self.enter_online().await,
            TrackChange::WentOffline => self.enter_offline(),
            TrackChange::Replaced(track) => {
                debug!("Room {} replaced its {} track", self.name, kind);
                for participant in self.participants() {
                    if let Err(e) = push_tracks(&participant, std::slice::from_ref(&track)).await {
                        warn!("Failed to renegotiate {} in {}: {}", participant.id(), self.name, e);
                    }
                }
            }
        }
    }

    /// Drop both tracks without awaiting participant renegotiation
    pub fn mark_offline(&self) {
        let went_offline = {
            let mut inner = self.inner.lock();
            inner.audio = None;
            inner.video = None;
            std::mem::replace(&mut inner.online, false)
        };
        if went_offline {
            self.enter_offline();
        }
    }

    async fn enter_online(&self) {
        info!("Room {} is online", self.name);
        if let Some(relay) = self.relay.upgrade() {
            relay.mesh().room_online(&self.name);
        }
        let tracks = self.tracks();
        for participant in self.participants() {
            if let Err(e) = push_tracks(&participant, &tracks).await {
                warn!("Failed to start stream for {} in {}: {}", participant.id(), self.name, e);
            }
        }
    }

    fn enter_offline(&self) {
        info!("Room {} is offline", self.name);
        if let Some(relay) = self.relay.upgrade() {
            relay.mesh().room_offline(&self.name);
        }
        for participant in self.participants() {
            if let Err(e) = participant.send_answer(AnswerType::Offline) {
                debug!("Could not notify {} that {} is offline: {}", participant.id(), self.name, e);
            }
        }
    }

    // ---- ingest ----

    /// Attach an ingest connection; false if one is already attached
    pub fn assign_ingest(&self, channel: Arc<Channel>) -> bool {
        let mut inner = self.inner.lock();
        if inner.ingest.is_some() {
            return false;
        }
        inner.ingest = Some(channel);
        true
    }

    pub fn has_ingest(&self) -> bool {
        self.inner.lock().ingest.is_some()
    }

    pub fn set_ingest_peer_connection(&self, pc: Arc<dyn PeerConnection>) {
        self.inner.lock().ingest_pc = Some(pc);
    }

    /// Release the ingest and everything it brought with it
    pub async fn clear_ingest(&self) {
        let (pc, online) = {
            let mut inner = self.inner.lock();
            inner.ingest = None;
            inner.data_channel = None;
            inner.audio = None;
            inner.video = None;
            (inner.ingest_pc.take(), std::mem::replace(&mut inner.online, false))
        };
        if online {
            self.enter_offline();
        }
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                debug!("Ingest connection for {} close failed: {}", self.name, e);
            }
        }
    }

    pub fn set_data_channel(&self, dc: Option<Arc<dyn DataChannel>>) {
        self.inner.lock().data_channel = dc;
    }

    pub fn has_data_channel(&self) -> bool {
        self.inner.lock().data_channel.is_some()
    }

    /// Pass viewer input toward the stream source
    pub async fn send_to_ingest(&self, data: &[u8]) -> Result<(), RelayError> {
        let dc = self
            .inner
            .lock()
            .data_channel
            .clone()
            .ok_or(RelayError::NoDataChannel)?;
        dc.send(data).await?;
        Ok(())
    }

    // ---- participants ----

    pub fn add_participant(&self, participant: Arc<Participant>) {
        self.participants.insert(participant.id(), participant);
    }

    pub fn remove_participant(&self, id: &ParticipantId) -> Option<Arc<Participant>> {
        self.participants.remove(id)
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<Arc<Participant>> {
        self.participants.get(id)
    }

    pub fn participants(&self) -> Vec<Arc<Participant>> {
        self.participants.values()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Nothing keeps the room alive: no viewers, no ingest, not online
    pub fn is_idle(&self) -> bool {
        if !self.participants.is_empty() {
            return false;
        }
        let inner = self.inner.lock();
        !inner.online && inner.ingest.is_none()
    }
}

async fn push_tracks(participant: &Participant, tracks: &[MediaTrack]) -> Result<(), RelayError> {
    for track in tracks {
        participant.add_track(track).await?;
    }
    participant.signal_offer().await
}
