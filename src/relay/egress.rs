//! Viewer session

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::media::{DataChannelOptions, PeerEvent};
use crate::transport::{AnswerType, Channel, ClientMessage, Inbound, Inbox};

use super::error::RelayError;
use super::participant::{Participant, PARTICIPANT_DATA_LABEL};
use super::registry::Relay;
use super::room::Room;

pub async fn run_participant(
    relay: Arc<Relay>,
    room: Arc<Room>,
    channel: Arc<Channel>,
    mut inbox: Inbox,
) -> Result<(), RelayError> {
    let participant = Arc::new(Participant::new(channel));
    room.add_participant(participant.clone());
    info!(
        "Participant {} ({}) joined room {}",
        participant.name(),
        participant.id(),
        room.name()
    );

    let result = serve_participant(&relay, &room, &participant, &mut inbox).await;

    room.remove_participant(&participant.id());
    participant.close().await;
    relay.delete_room_if_empty(&room);
    info!("Participant {} left room {}", participant.id(), room.name());
    result
}

async fn serve_participant(
    relay: &Arc<Relay>,
    room: &Arc<Room>,
    participant: &Arc<Participant>,
    inbox: &mut Inbox,
) -> Result<(), RelayError> {
    let mesh = relay.mesh();

    if !room.is_online() {
        participant.send_answer(AnswerType::Offline)?;
        if mesh.is_remote_room(room.name()) {
            mesh.request_stream(room.name());
        }
    }

    let (pc, mut events) = relay
        .media()
        .create_peer_connection(&format!("participant-{}", participant.id()))
        .await?;
    participant.set_peer_connection(pc.clone());
    let dc = pc
        .create_data_channel(
            PARTICIPANT_DATA_LABEL,
            DataChannelOptions {
                ordered: true,
                max_retransmits: Some(0),
            },
        )
        .await?;
    participant.set_data_channel(dc);
    participant.send_answer(AnswerType::Ok)?;

    if room.is_online() {
        for track in room.tracks() {
            participant.add_track(&track).await?;
        }
        participant.signal_offer().await?;
    }

    loop {
        tokio::select! {
            inbound = inbox.recv() => match inbound {
                Some(Inbound::Text(text)) => handle_participant_message(participant, &text).await,
                Some(Inbound::Binary(_)) => debug!("Ignoring binary frame from {}", participant.id()),
                None => break,
            },
            event = events.recv() => match event {
                Some(PeerEvent::IceCandidate(candidate)) => {
                    let _ = participant.send_ice(candidate);
                }
                Some(PeerEvent::DataChannelMessage { label, data }) if label == PARTICIPANT_DATA_LABEL => {
                    if let Err(e) = room.send_to_ingest(&data).await {
                        debug!("Dropped input from {}: {}", participant.id(), e);
                    }
                }
                Some(PeerEvent::StateChanged(state)) if state.is_terminal() => {
                    debug!("Participant {} connection is {:?}", participant.id(), state);
                    break;
                }
                Some(other) => debug!("Participant {} event: {:?}", participant.id(), other),
                None => break,
            },
        }
    }
    Ok(())
}

/// The viewer's peer connection always lives on this relay, so its
/// signaling is applied here even while the room is relayed from elsewhere
async fn handle_participant_message(participant: &Participant, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Invalid message from participant {}: {}", participant.id(), e);
            return;
        }
    };

    match message {
        ClientMessage::Sdp { sdp } => {
            if let Err(e) = participant.set_remote_description(sdp).await {
                warn!("Failed to apply SDP from {}: {}", participant.id(), e);
            }
        }
        ClientMessage::Ice { candidate } => {
            if let Err(e) = participant.add_ice_candidate(candidate).await {
                warn!("Failed to add ICE candidate from {}: {}", participant.id(), e);
            }
        }
        other => debug!("Unexpected {:?} from participant {}", other, participant.id()),
    }
}
