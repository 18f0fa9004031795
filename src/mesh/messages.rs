//! Binary relay-to-relay protocol
//!
//! Messages are bincode encoded. Only the handshake travels as a plain frame;
//! everything after admission is sealed with the peer's [`MeshCipher`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::{MeshCipher, ParticipantId, RelayId};
use crate::media::{IceCandidate, SessionDescription};

use super::error::MeshError;
use super::state::RoomEntity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshMessage {
    Handshake {
        relay_id: RelayId,
        dh_public_key: Vec<u8>,
        /// Ed25519 key approvals from this relay verify against
        signing_key: Vec<u8>,
    },
    HandshakeResponse {
        relay_id: RelayId,
        dh_public_key: Vec<u8>,
        signing_key: Vec<u8>,
        approvals: HashMap<RelayId, Vec<u8>>,
    },
    StateUpdate {
        sequence: u64,
        entities: HashMap<String, RoomEntity>,
    },
    Ack {
        relay_id: RelayId,
        sequence: u64,
    },
    Heartbeat {
        relay_id: RelayId,
        /// Milliseconds since the Unix epoch
        timestamp: u64,
    },
    SuspectRelay {
        relay_id: RelayId,
        reason: String,
    },
    Disconnect {
        relay_id: RelayId,
        reason: String,
    },
    ForwardSdp {
        room_name: Option<String>,
        participant_id: Option<ParticipantId>,
        sdp: SessionDescription,
    },
    ForwardIce {
        room_name: Option<String>,
        participant_id: Option<ParticipantId>,
        candidate: IceCandidate,
    },
    ForwardIngest {
        room_name: String,
    },
    StreamRequest {
        room_name: String,
    },
}

impl MeshMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            MeshMessage::Handshake { .. } => "handshake",
            MeshMessage::HandshakeResponse { .. } => "handshake_response",
            MeshMessage::StateUpdate { .. } => "state_update",
            MeshMessage::Ack { .. } => "ack",
            MeshMessage::Heartbeat { .. } => "heartbeat",
            MeshMessage::SuspectRelay { .. } => "suspect_relay",
            MeshMessage::Disconnect { .. } => "disconnect",
            MeshMessage::ForwardSdp { .. } => "forward_sdp",
            MeshMessage::ForwardIce { .. } => "forward_ice",
            MeshMessage::ForwardIngest { .. } => "forward_ingest",
            MeshMessage::StreamRequest { .. } => "stream_request",
        }
    }
}

/// Wire envelope of a mesh message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshFrame {
    Plain(MeshMessage),
    Sealed { nonce: Vec<u8>, ciphertext: Vec<u8> },
}

impl MeshFrame {
    pub fn encode(&self) -> Result<Vec<u8>, MeshError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MeshError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Encrypt a message for an admitted peer
    pub fn seal(cipher: &MeshCipher, message: &MeshMessage) -> Result<Self, MeshError> {
        let plaintext = bincode::serialize(message)?;
        let (nonce, ciphertext) = cipher.seal(&plaintext)?;
        Ok(MeshFrame::Sealed {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt a sealed frame; plain frames are refused
    pub fn open(self, cipher: &MeshCipher) -> Result<MeshMessage, MeshError> {
        match self {
            MeshFrame::Sealed { nonce, ciphertext } => {
                let plaintext = cipher.open(&nonce, &ciphertext)?;
                Ok(bincode::deserialize(&plaintext)?)
            }
            MeshFrame::Plain(message) => Err(MeshError::UnsealedFrame(message.kind())),
        }
    }
}
