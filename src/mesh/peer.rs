//! Admitted peer relays and outstanding state acknowledgements

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use tokio::time::Instant;

use crate::common::{MeshCipher, RelayId, SafeMap};
use crate::transport::Channel;

/// Record of one admitted peer relay
#[derive(Clone)]
pub struct PeerRelay {
    pub id: RelayId,
    pub channel: Arc<Channel>,
    pub cipher: Arc<MeshCipher>,
    pub signing_key: VerifyingKey,
    pub last_heartbeat: Instant,
    pub suspect_count: u32,
    /// Highest state sequence applied from this peer
    pub last_sequence: u64,
}

impl PeerRelay {
    pub fn new(
        id: RelayId,
        channel: Arc<Channel>,
        cipher: MeshCipher,
        signing_key: VerifyingKey,
    ) -> Self {
        Self {
            id,
            channel,
            cipher: Arc::new(cipher),
            signing_key,
            last_heartbeat: Instant::now(),
            suspect_count: 0,
            last_sequence: 0,
        }
    }
}

/// Sequence number to the peers that still owe an ack, with last send time
#[derive(Default)]
pub struct PendingAcks {
    entries: SafeMap<u64, HashMap<RelayId, Instant>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sequence: u64, peers: impl IntoIterator<Item = RelayId>, now: Instant) {
        let waiting: HashMap<RelayId, Instant> = peers.into_iter().map(|id| (id, now)).collect();
        if !waiting.is_empty() {
            self.entries.insert(sequence, waiting);
        }
    }

    /// Clear one peer from a sequence; returns true if it was pending
    pub fn ack(&self, sequence: u64, peer: &RelayId) -> bool {
        self.entries.with_mut(|entries| {
            let Some(waiting) = entries.get_mut(&sequence) else {
                return false;
            };
            let removed = waiting.remove(peer).is_some();
            if waiting.is_empty() {
                entries.remove(&sequence);
            }
            removed
        })
    }

    /// Drop an evicted peer from every sequence
    pub fn forget_peer(&self, peer: &RelayId) {
        self.entries.retain(|_, waiting| {
            waiting.remove(peer);
            !waiting.is_empty()
        });
    }

    /// `(sequence, peer)` pairs last sent more than `older_than` ago
    pub fn overdue(&self, older_than: Duration, now: Instant) -> Vec<(u64, RelayId)> {
        let mut overdue: Vec<(u64, RelayId)> = self
            .entries
            .snapshot()
            .into_iter()
            .flat_map(|(sequence, waiting)| {
                waiting
                    .into_iter()
                    .filter(move |(_, sent)| now.duration_since(*sent) > older_than)
                    .map(move |(peer, _)| (sequence, peer))
            })
            .collect();
        overdue.sort();
        overdue
    }

    pub fn refresh(&self, sequence: u64, peer: &RelayId, now: Instant) {
        self.entries.update(&sequence, |waiting| {
            if let Some(sent) = waiting.get_mut(peer) {
                *sent = now;
            }
        });
    }

    pub fn waiting_on(&self, sequence: u64) -> Vec<RelayId> {
        self.entries
            .get(&sequence)
            .map(|waiting| waiting.into_keys().collect())
            .unwrap_or_default()
    }

    pub fn is_pending(&self, sequence: u64) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::new_id;

    #[test]
    fn test_entry_dropped_when_all_acked() {
        let pending = PendingAcks::new();
        let (a, b) = (new_id(), new_id());
        pending.record(1, [a, b], Instant::now());

        assert!(pending.ack(1, &a));
        assert!(pending.is_pending(1));
        assert!(!pending.ack(1, &a));
        assert!(pending.ack(1, &b));
        assert!(!pending.is_pending(1));
        assert!(!pending.ack(1, &b));
    }

    #[test]
    fn test_forget_peer_completes_sequences() {
        let pending = PendingAcks::new();
        let (a, b) = (new_id(), new_id());
        let now = Instant::now();
        pending.record(1, [a], now);
        pending.record(2, [a, b], now);

        pending.forget_peer(&a);

        assert!(!pending.is_pending(1));
        assert_eq!(pending.waiting_on(2), vec![b]);
    }

    #[test]
    fn test_record_without_recipients_is_noop() {
        let pending = PendingAcks::new();
        pending.record(5, Vec::new(), Instant::now());
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_and_refresh() {
        let pending = PendingAcks::new();
        let peer = new_id();
        pending.record(3, [peer], Instant::now());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(pending
            .overdue(Duration::from_secs(10), Instant::now())
            .is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(
            pending.overdue(Duration::from_secs(10), Instant::now()),
            vec![(3, peer)]
        );

        pending.refresh(3, &peer, Instant::now());
        assert!(pending
            .overdue(Duration::from_secs(10), Instant::now())
            .is_empty());
    }
}
