//! Admission quorum and eviction thresholds
//!
//! The responder signs `sha256(candidate)` once for each relay it is already
//! meshed with, labelling each signature with that relay's ID. The candidate
//! counts a signature only when the label is one of its own admitted peers and
//! it verifies under that peer's key or the responder's key.

use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;

use crate::common::{verify_approval, RelayId, RelayIdentity};

/// Signatures needed to join a mesh of `existing_peers` relays
pub fn required_approvals(existing_peers: usize) -> usize {
    if existing_peers <= 1 {
        return 0;
    }
    // ceil(0.8 * n) in integer arithmetic
    ((existing_peers * 4).div_ceil(5)).max(1)
}

/// Local suspect count at which a peer is evicted
pub fn eviction_threshold(peer_count: usize) -> u32 {
    (peer_count / 2 + 1) as u32
}

pub fn request_approvals(
    identity: &RelayIdentity,
    candidate: &RelayId,
    existing_peers: &[RelayId],
) -> HashMap<RelayId, Vec<u8>> {
    existing_peers
        .iter()
        .filter(|peer| *peer != candidate)
        .map(|peer| (*peer, identity.sign_approval(candidate)))
        .collect()
}

/// Number of approvals that check out against the candidate's view of the mesh
pub fn count_valid_approvals(
    approvals: &HashMap<RelayId, Vec<u8>>,
    candidate: &RelayId,
    responder_key: &VerifyingKey,
    known_peers: &HashMap<RelayId, VerifyingKey>,
) -> usize {
    approvals
        .iter()
        .filter(|(label, signature)| {
            let Some(peer_key) = known_peers.get(label) else {
                return false;
            };
            verify_approval(peer_key, candidate, signature)
                || verify_approval(responder_key, candidate, signature)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::new_id;

    #[test]
    fn test_quorum_sizes() {
        assert_eq!(required_approvals(0), 0);
        assert_eq!(required_approvals(1), 0);
        assert_eq!(required_approvals(2), 2);
        assert_eq!(required_approvals(5), 4);
        assert_eq!(required_approvals(10), 8);
    }

    #[test]
    fn test_eviction_threshold() {
        assert_eq!(eviction_threshold(1), 1);
        assert_eq!(eviction_threshold(4), 3);
        assert_eq!(eviction_threshold(5), 3);
    }

    fn mesh_of(n: usize) -> HashMap<RelayId, VerifyingKey> {
        (0..n)
            .map(|_| (new_id(), RelayIdentity::generate().verifying_key()))
            .collect()
    }

    #[test]
    fn test_five_peer_quorum() {
        let responder = RelayIdentity::generate();
        let candidate = new_id();
        let known = mesh_of(5);
        let peers: Vec<RelayId> = known.keys().copied().collect();

        let full = request_approvals(&responder, &candidate, &peers);
        let valid = count_valid_approvals(&full, &candidate, &responder.verifying_key(), &known);
        assert_eq!(valid, 5);
        assert!(valid >= required_approvals(known.len()));

        let short = request_approvals(&responder, &candidate, &peers[..3]);
        let valid = count_valid_approvals(&short, &candidate, &responder.verifying_key(), &known);
        assert_eq!(valid, 3);
        assert!(valid < required_approvals(known.len()));
    }

    #[test]
    fn test_unknown_labels_and_forged_signatures_rejected() {
        let responder = RelayIdentity::generate();
        let forger = RelayIdentity::generate();
        let candidate = new_id();
        let known = mesh_of(2);
        let peers: Vec<RelayId> = known.keys().copied().collect();

        let mut approvals = HashMap::new();
        approvals.insert(new_id(), responder.sign_approval(&candidate));
        approvals.insert(peers[0], forger.sign_approval(&candidate));
        approvals.insert(peers[1], responder.sign_approval(&new_id()));

        let valid = count_valid_approvals(&approvals, &candidate, &responder.verifying_key(), &known);
        assert_eq!(valid, 0);
    }

    #[test]
    fn test_candidate_never_approves_itself() {
        let responder = RelayIdentity::generate();
        let candidate = new_id();
        let approvals = request_approvals(&responder, &candidate, &[candidate, new_id()]);
        assert_eq!(approvals.len(), 1);
        assert!(!approvals.contains_key(&candidate));
    }
}
