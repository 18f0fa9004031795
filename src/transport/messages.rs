//! JSON messages exchanged with viewers and ingest nodes
//!
//! `payload_type` selects the message. Joiner and answer kinds travel as
//! integers, matching the browser and node clients.

use serde::{Deserialize, Serialize};

use crate::media::{IceCandidate, SessionDescription};

/// Who is joining a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum JoinerType {
    /// Ingest node producing the stream
    Node = 0,
    /// Viewer
    Client = 1,
}

impl TryFrom<u8> for JoinerType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(JoinerType::Node),
            1 => Ok(JoinerType::Client),
            other => Err(format!("unknown joiner type {}", other)),
        }
    }
}

impl From<JoinerType> for u8 {
    fn from(value: JoinerType) -> Self {
        value as u8
    }
}

/// Relay verdict sent to a joiner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AnswerType {
    Offline = 0,
    InUse = 1,
    Ok = 2,
}

impl TryFrom<u8> for AnswerType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AnswerType::Offline),
            1 => Ok(AnswerType::InUse),
            2 => Ok(AnswerType::Ok),
            other => Err(format!("unknown answer type {}", other)),
        }
    }
}

impl From<AnswerType> for u8 {
    fn from(value: AnswerType) -> Self {
        value as u8
    }
}

/// Client and ingest protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "payload_type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        joiner_type: JoinerType,
    },
    Sdp {
        sdp: SessionDescription,
    },
    Ice {
        candidate: IceCandidate,
    },
    Answer {
        answer_type: AnswerType,
    },
    Log {
        level: String,
        message: String,
        time: String,
    },
    Metrics {
        usage_cpu: f64,
        usage_memory: f64,
        uptime: u64,
        pipeline_latency: f64,
    },
}

impl ClientMessage {
    pub fn answer(answer_type: AnswerType) -> Self {
        ClientMessage::Answer { answer_type }
    }
}

/// Operator command accepted on the control endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ControlCommand {
    JoinMesh(String),
}

/// Reply to a control command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    pub message: String,
}
