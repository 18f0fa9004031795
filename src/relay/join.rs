//! First-message dispatch for room connections

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::transport::{Channel, ClientMessage, Inbound, Inbox, JoinerType};

use super::egress::run_participant;
use super::error::RelayError;
use super::ingest::run_ingest;
use super::registry::Relay;

pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve a `/api/ws/{room}` connection. The first valid message must be a
/// join, which decides whether the peer is the room's ingest or a viewer.
pub async fn serve_room_connection(
    relay: Arc<Relay>,
    room_name: String,
    channel: Arc<Channel>,
    mut inbox: Inbox,
) -> Result<(), RelayError> {
    let joiner_type = match tokio::time::timeout(JOIN_TIMEOUT, wait_for_join(&channel, &mut inbox)).await {
        Ok(Ok(joiner_type)) => joiner_type,
        Ok(Err(e)) => {
            channel.close();
            return Err(e);
        }
        Err(_) => {
            warn!("No join from {} for room {}", channel.remote(), room_name);
            channel.close();
            return Err(RelayError::JoinTimeout);
        }
    };

    info!("{} joined room {} as {:?}", channel.remote(), room_name, joiner_type);
    let room = relay.get_or_create_room(&room_name);
    match joiner_type {
        JoinerType::Node => run_ingest(relay, room, channel, inbox).await,
        JoinerType::Client => run_participant(relay, room, channel, inbox).await,
    }
}

async fn wait_for_join(channel: &Channel, inbox: &mut Inbox) -> Result<JoinerType, RelayError> {
    loop {
        let text = match inbox.recv().await {
            Some(Inbound::Text(text)) => text,
            Some(Inbound::Binary(_)) => continue,
            None => return Err(RelayError::ClosedBeforeJoin),
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Join { joiner_type }) => return Ok(joiner_type),
            Ok(other) => debug!("Expected join from {}, got {:?}", channel.remote(), other),
            Err(e) => warn!("Invalid message from {}: {}", channel.remote(), e),
        }
    }
}
