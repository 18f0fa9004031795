//! Ingest (stream source) session
//!
//! A node that joins a room becomes its ingest. Its audio and video tracks
//! bring the room online; its data channel receives viewer input.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::media::{PeerConnection, PeerEvent, SdpKind};
use crate::transport::{AnswerType, Channel, ClientMessage, Inbound, Inbox};

use super::error::RelayError;
use super::registry::Relay;
use super::room::Room;

/// Opus parameter some encoders emit that breaks negotiation
const SPROP_MAX_CAPTURE_RATE: &str = ";sprop-maxcapturerate=24000";

pub async fn run_ingest(
    relay: Arc<Relay>,
    room: Arc<Room>,
    channel: Arc<Channel>,
    mut inbox: Inbox,
) -> Result<(), RelayError> {
    let mesh = relay.mesh();

    if let Some(owner) = mesh
        .state()
        .active_owner(room.name())
        .filter(|owner| *owner != relay.id())
    {
        info!("Ingest for room {} belongs to relay {}", room.name(), owner);
        if let Err(e) = mesh.forward_ingest(&owner, room.name()) {
            warn!("Failed to forward ingest for {}: {}", room.name(), e);
        }
        channel.send_json(&ClientMessage::answer(AnswerType::InUse))?;
        channel.close();
        relay.delete_room_if_empty(&room);
        return Ok(());
    }

    if room.is_online() || !room.assign_ingest(channel.clone()) {
        info!("Room {} already has an ingest", room.name());
        channel.send_json(&ClientMessage::answer(AnswerType::InUse))?;
        channel.close();
        return Ok(());
    }

    let result = serve_ingest(&relay, &room, &channel, &mut inbox).await;

    room.clear_ingest().await;
    channel.close();
    relay.delete_room_if_empty(&room);
    info!("Ingest for room {} disconnected", room.name());
    result
}

async fn serve_ingest(
    relay: &Arc<Relay>,
    room: &Arc<Room>,
    channel: &Arc<Channel>,
    inbox: &mut Inbox,
) -> Result<(), RelayError> {
    let (pc, mut events) = relay
        .media()
        .create_peer_connection(&format!("nestri-{}", room.name()))
        .await?;
    room.set_ingest_peer_connection(pc.clone());
    channel.send_json(&ClientMessage::answer(AnswerType::Ok))?;
    info!("Ingest attached to room {}", room.name());

    loop {
        tokio::select! {
            inbound = inbox.recv() => match inbound {
                Some(Inbound::Text(text)) => handle_ingest_message(room, &pc, channel, &text).await,
                Some(Inbound::Binary(_)) => debug!("Ignoring binary frame from ingest of {}", room.name()),
                None => break,
            },
            event = events.recv() => match event {
                Some(PeerEvent::IceCandidate(candidate)) => {
                    let _ = channel.send_json(&ClientMessage::Ice { candidate });
                }
                Some(PeerEvent::Track(track)) => {
                    info!("Ingest of {} sent {} track", room.name(), track.kind());
                    room.set_track(track.kind(), Some(track)).await;
                }
                Some(PeerEvent::TrackEnded(kind)) => room.set_track(kind, None).await,
                Some(PeerEvent::DataChannel(dc)) => {
                    debug!("Ingest data channel {} opened for {}", dc.label(), room.name());
                    room.set_data_channel(Some(dc));
                }
                Some(PeerEvent::StateChanged(state)) if state.is_terminal() => {
                    debug!("Ingest connection for {} is {:?}", room.name(), state);
                    break;
                }
                Some(other) => debug!("Ingest {} event: {:?}", room.name(), other),
                None => break,
            },
        }
    }
    Ok(())
}

async fn handle_ingest_message(
    room: &Room,
    pc: &Arc<dyn PeerConnection>,
    channel: &Channel,
    text: &str,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Invalid message from ingest of {}: {}", room.name(), e);
            return;
        }
    };

    match message {
        ClientMessage::Sdp { mut sdp } if sdp.kind == SdpKind::Offer => {
            sdp.sdp = sdp.sdp.replace(SPROP_MAX_CAPTURE_RATE, "");
            let answer = async {
                pc.set_remote_description(sdp).await?;
                pc.create_answer().await
            };
            match answer.await {
                Ok(answer) => {
                    let _ = channel.send_json(&ClientMessage::Sdp { sdp: answer });
                }
                Err(e) => warn!("Failed to answer ingest offer for {}: {}", room.name(), e),
            }
        }
        ClientMessage::Sdp { .. } => debug!("Ignoring non-offer SDP from ingest of {}", room.name()),
        ClientMessage::Ice { candidate } => {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!("Failed to add ingest ICE candidate for {}: {}", room.name(), e);
            }
        }
        ClientMessage::Log { level, message, time } => match level.to_ascii_lowercase().as_str() {
            "error" => error!("[{}] ingest {}: {}", time, room.name(), message),
            "warn" | "warning" => warn!("[{}] ingest {}: {}", time, room.name(), message),
            "debug" => debug!("[{}] ingest {}: {}", time, room.name(), message),
            _ => info!("[{}] ingest {}: {}", time, room.name(), message),
        },
        ClientMessage::Metrics {
            usage_cpu,
            usage_memory,
            uptime,
            pipeline_latency,
        } => debug!(
            "Ingest {} metrics: cpu {:.1}% memory {:.1} uptime {}s latency {:.1}ms",
            room.name(),
            usage_cpu,
            usage_memory,
            uptime,
            pipeline_latency
        ),
        other => debug!("Unexpected {:?} from ingest of {}", other, room.name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sprop_stripped() {
        let sdp = "a=fmtp:111 minptime=10;useinbandfec=1;sprop-maxcapturerate=24000\r\n";
        assert_eq!(
            sdp.replace(SPROP_MAX_CAPTURE_RATE, ""),
            "a=fmtp:111 minptime=10;useinbandfec=1\r\n"
        );
    }
}
