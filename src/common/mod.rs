//! Shared building blocks
//!
//! Identifier generation, the concurrent map used by every registry, and the
//! cryptographic helpers behind mesh admission and frame encryption.

mod crypto;
mod safe_map;

use tokio::sync::watch;
use uuid::Uuid;

pub use crypto::{
    approval_digest, parse_public_key, parse_verifying_key, verify_approval, CryptoError,
    KeyPair, MeshCipher, RelayIdentity, NONCE_SIZE,
};
pub use safe_map::SafeMap;

/// Identifier of a relay process in the mesh
pub type RelayId = Uuid;

/// Identifier of a room on a single relay
pub type RoomId = Uuid;

/// Identifier of a viewing participant
pub type ParticipantId = Uuid;

/// Generate a new time-sortable identifier
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Resolves once the flag is set. The borrow taken by `wait_for` is dropped
/// here so callers can race this against other awaits inside `select!`.
pub async fn flag_raised(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|raised| *raised).await;
}
