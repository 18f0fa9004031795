//! Viewing participants

use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::common::{new_id, ParticipantId};
use crate::media::{DataChannel, IceCandidate, MediaError, MediaTrack, PeerConnection, SessionDescription};
use crate::transport::{AnswerType, Channel, ClientMessage, TransportError};

use super::error::RelayError;

/// Label of the viewer input data channel
pub const PARTICIPANT_DATA_LABEL: &str = "data";

const NAME_MOODS: &[&str] = &[
    "Happy", "Sad", "Angry", "Calm", "Excited", "Bored", "Confused", "Confident", "Curious",
    "Depressed", "Disappointed", "Embarrassed", "Energetic", "Fearful", "Frustrated", "Glad",
    "Guilty", "Hopeful", "Impatient", "Jealous", "Lonely", "Motivated", "Nervous", "Optimistic",
    "Pessimistic", "Proud", "Relaxed", "Shy", "Stressed", "Surprised", "Tired", "Worried",
];

const NAME_CREATURES: &[&str] = &[
    "Dragon", "Unicorn", "Troll", "Goblin", "Elf", "Dwarf", "Ogre", "Gnome", "Mermaid", "Siren",
    "Vampire", "Ghoul", "Werewolf", "Minotaur", "Centaur", "Griffin", "Phoenix", "Wyvern", "Hydra",
    "Kraken",
];

/// Random display name such as "Curious Griffin"
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let mood = NAME_MOODS.choose(&mut rng).copied().unwrap_or("Calm");
    let creature = NAME_CREATURES.choose(&mut rng).copied().unwrap_or("Dragon");
    format!("{} {}", mood, creature)
}

pub struct Participant {
    id: ParticipantId,
    name: String,
    channel: Arc<Channel>,
    peer_connection: Mutex<Option<Arc<dyn PeerConnection>>>,
    data_channel: Mutex<Option<Arc<dyn DataChannel>>>,
}

impl Participant {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            id: new_id(),
            name: random_name(),
            channel,
            peer_connection: Mutex::new(None),
            data_channel: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn set_peer_connection(&self, pc: Arc<dyn PeerConnection>) {
        *self.peer_connection.lock() = Some(pc);
    }

    pub fn peer_connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer_connection.lock().clone()
    }

    pub fn set_data_channel(&self, dc: Arc<dyn DataChannel>) {
        *self.data_channel.lock() = Some(dc);
    }

    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.data_channel.lock().clone()
    }

    /// Attach a room track to this viewer's connection
    pub async fn add_track(&self, track: &MediaTrack) -> Result<(), RelayError> {
        let pc = self.peer_connection().ok_or(RelayError::NoPeerConnection)?;
        pc.add_track(track).await?;
        Ok(())
    }

    /// Create an offer, install it locally and send it to the viewer
    pub async fn signal_offer(&self) -> Result<(), RelayError> {
        let pc = self.peer_connection().ok_or(RelayError::NoPeerConnection)?;
        let offer = pc.create_offer().await?;
        self.channel.send_json(&ClientMessage::Sdp { sdp: offer })?;
        Ok(())
    }

    pub async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), MediaError> {
        let pc = self.peer_connection().ok_or(MediaError::Closed)?;
        pc.set_remote_description(sdp).await
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let pc = self.peer_connection().ok_or(MediaError::Closed)?;
        pc.add_ice_candidate(candidate).await
    }

    pub fn send_answer(&self, answer_type: AnswerType) -> Result<(), TransportError> {
        self.channel.send_json(&ClientMessage::answer(answer_type))
    }

    pub fn send_ice(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.channel.send_json(&ClientMessage::Ice { candidate })
    }

    pub async fn close(&self) {
        let pc = self.peer_connection.lock().take();
        if let Some(pc) = pc {
            let _ = pc.close().await;
        }
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_name_shape() {
        let name = random_name();
        let (mood, creature) = name.split_once(' ').unwrap();
        assert!(NAME_MOODS.contains(&mood));
        assert!(NAME_CREATURES.contains(&creature));
    }

    #[tokio::test]
    async fn test_signal_offer_requires_peer_connection() {
        let ((channel, _inbox), _other) = Channel::pair();
        let participant = Participant::new(channel);

        assert!(matches!(
            participant.signal_offer().await,
            Err(RelayError::NoPeerConnection)
        ));
    }
}
