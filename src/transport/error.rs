//! Transport error types

use thiserror::Error;

/// Errors that can occur on a transport channel
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
