//! The want set as a sans-IO state machine.
//!
//! [`State`] is owned by the want manager actor. The actor feeds it inputs through its methods
//! and afterwards drains the IO the state machine asks for as [`OutEvent`]s.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::SystemTime,
};

use tracing::{debug, trace};

use crate::{
    metrics::WantMetrics,
    refs::{BlobRef, Hash, PeerId},
};

/// Where a want is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantState {
    /// Waiting for a peer that has the blob.
    Wanted,
    /// Being retrieved.
    Fetching {
        /// The peer the blob is retrieved from.
        from: PeerId,
    },
    /// Verified and stored.
    Resolved,
    /// Larger than the maximum size, will not be fetched.
    Dropped,
    /// Given up on.
    Expired,
}

impl WantState {
    /// Whether the want is still being worked on.
    pub fn is_live(&self) -> bool {
        matches!(self, WantState::Wanted | WantState::Fetching { .. })
    }
}

/// A single tracked blob.
#[derive(Debug, Clone)]
pub struct WantEntry {
    blob: BlobRef,
    state: WantState,
    requested_at: SystemTime,
    hints: BTreeSet<PeerId>,
    skip: BTreeSet<PeerId>,
    verify_failures: u32,
}

impl WantEntry {
    fn new(blob: BlobRef, hint: Option<PeerId>) -> Self {
        Self {
            blob,
            state: WantState::Wanted,
            requested_at: SystemTime::now(),
            hints: hint.into_iter().collect(),
            skip: BTreeSet::new(),
            verify_failures: 0,
        }
    }

    /// The wanted blob.
    pub fn blob(&self) -> BlobRef {
        self.blob
    }

    /// Current state.
    pub fn state(&self) -> WantState {
        self.state
    }

    /// When the blob was first wanted.
    pub fn requested_at(&self) -> SystemTime {
        self.requested_at
    }

    /// Peers known to have the blob.
    pub fn hints(&self) -> &BTreeSet<PeerId> {
        &self.hints
    }

    /// How often received content did not match the hash.
    pub fn verify_failures(&self) -> u32 {
        self.verify_failures
    }
}

/// IO requested by the state machine.
#[must_use = "OutEvents must be handled"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutEvent {
    /// Ask peers whether they have a blob.
    Announce { blob: BlobRef, peers: Vec<PeerId> },
    /// Retrieve a blob from a peer.
    StartFetch { blob: BlobRef, from: PeerId },
    /// Stop retrieving a blob, the result is no longer needed.
    CancelFetch { hash: Hash },
}

/// Why received content was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The content is larger than the maximum size.
    TooLarge { size: u64, max: u64 },
    /// The content does not hash to the wanted hash.
    HashMismatch { actual: Hash },
}

/// Checks received content against the wanted blob and the size limit.
pub fn check_content(blob: &BlobRef, content: &[u8], max_size: u64) -> Result<(), Rejection> {
    let size = content.len() as u64;
    if size > max_size {
        return Err(Rejection::TooLarge { size, max: max_size });
    }
    let actual = Hash::new(content);
    if actual != blob.hash() {
        return Err(Rejection::HashMismatch { actual });
    }
    Ok(())
}

/// The want set.
#[derive(Debug)]
pub struct State {
    entries: HashMap<Hash, WantEntry>,
    /// Peers we are currently connected to.
    peers: BTreeSet<PeerId>,
    max_size: u64,
    max_verify_failures: u32,
    metrics: Arc<WantMetrics>,
    actions: Vec<OutEvent>,
}

impl State {
    pub fn new(max_size: u64, max_verify_failures: u32, metrics: Arc<WantMetrics>) -> Self {
        Self {
            entries: Default::default(),
            peers: Default::default(),
            max_size,
            max_verify_failures,
            metrics,
            actions: Default::default(),
        }
    }

    /// Drains the IO requested since the last call.
    pub fn events(&mut self) -> impl Iterator<Item = OutEvent> + '_ {
        self.actions.drain(..)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn get(&self, hash: &Hash) -> Option<&WantEntry> {
        self.entries.get(hash)
    }

    pub fn snapshot(&self) -> Vec<WantEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn is_fetching_from(&self, hash: &Hash, peer: &PeerId) -> bool {
        self.entries
            .get(hash)
            .is_some_and(|entry| entry.state == WantState::Fetching { from: *peer })
    }

    /// Registers desire for a blob.
    pub fn want(&mut self, blob: BlobRef, hint: Option<PeerId>) {
        let hash = blob.hash();
        if let Some(entry) = self.entries.get_mut(&hash) {
            trace!(%blob, state = ?entry.state, "already wanted");
            if let Some(hint) = hint {
                entry.hints.insert(hint);
            }
            self.try_fetch(&hash);
            return;
        }

        let mut entry = WantEntry::new(blob, hint);
        self.metrics.events.inc();
        if let Some(size) = blob.size().filter(|size| *size > self.max_size) {
            debug!(%blob, size, max = self.max_size, "declared size too large, dropping");
            entry.state = WantState::Dropped;
            self.entries.insert(hash, entry);
            self.metrics.blobs_dropped.inc();
            return;
        }

        debug!(%blob, "new want");
        self.entries.insert(hash, entry);
        self.metrics.wants_issued.inc();
        if !self.peers.is_empty() {
            self.actions.push(OutEvent::Announce {
                blob,
                peers: self.peers.iter().copied().collect(),
            });
        }
        self.try_fetch(&hash);
        self.update_gauge();
    }

    /// Records that `from` holds `size` bytes of `blob`.
    pub fn have(&mut self, blob: BlobRef, from: PeerId, size: u64) {
        self.metrics.haves_received.inc();
        self.metrics.events.inc();
        let hash = blob.hash();
        let Some(entry) = self.entries.get_mut(&hash) else {
            trace!(%blob, from = %from.fmt_short(), "have for a blob we do not want");
            return;
        };
        entry.hints.insert(from);
        if entry.state != WantState::Wanted {
            return;
        }
        if size > self.max_size {
            debug!(%blob, size, max = self.max_size, from = %from.fmt_short(), "announced size too large, dropping");
            entry.state = WantState::Dropped;
            self.metrics.blobs_dropped.inc();
            self.update_gauge();
            return;
        }
        if entry.skip.contains(&from) {
            trace!(%blob, from = %from.fmt_short(), "peer sent bad content before, not fetching");
            return;
        }
        entry.state = WantState::Fetching { from };
        self.actions.push(OutEvent::StartFetch {
            blob: entry.blob,
            from,
        });
    }

    /// The blob was verified and stored. Returns the entry that was removed, if any.
    pub fn on_resolved(&mut self, hash: &Hash) -> Option<WantEntry> {
        let mut entry = self.entries.remove(hash)?;
        if let WantState::Fetching { .. } = entry.state {
            self.actions.push(OutEvent::CancelFetch { hash: *hash });
        }
        entry.state = WantState::Resolved;
        self.metrics.blobs_resolved.inc();
        self.metrics.events.inc();
        self.update_gauge();
        Some(entry)
    }

    /// Received content was refused. `from` is the peer that sent it, if it was fetched.
    pub fn on_rejected(&mut self, hash: &Hash, from: Option<PeerId>, rejection: Rejection) {
        let Some(entry) = self.entries.get_mut(hash) else {
            return;
        };
        if !entry.state.is_live() {
            return;
        }
        let was_fetching = matches!(entry.state, WantState::Fetching { .. });
        let fetched_from_sender = from.is_some_and(|from| entry.state == WantState::Fetching { from });
        match rejection {
            Rejection::TooLarge { size, max } => {
                debug!(blob = %entry.blob, size, max, "content too large, dropping");
                entry.state = WantState::Dropped;
                self.metrics.blobs_dropped.inc();
                self.metrics.events.inc();
                if was_fetching && !fetched_from_sender {
                    self.actions.push(OutEvent::CancelFetch { hash: *hash });
                }
            }
            Rejection::HashMismatch { actual } => {
                self.metrics.verification_failures.inc();
                entry.verify_failures += 1;
                if let Some(from) = from {
                    entry.hints.remove(&from);
                    entry.skip.insert(from);
                }
                debug!(
                    blob = %entry.blob,
                    actual = %actual.fmt_short(),
                    failures = entry.verify_failures,
                    "content does not match hash"
                );
                if entry.verify_failures >= self.max_verify_failures {
                    debug!(blob = %entry.blob, "too many verification failures, expiring");
                    entry.state = WantState::Expired;
                    self.metrics.wants_expired.inc();
                    if was_fetching && !fetched_from_sender {
                        self.actions.push(OutEvent::CancelFetch { hash: *hash });
                    }
                } else if !was_fetching || fetched_from_sender {
                    entry.state = WantState::Wanted;
                    self.try_fetch(hash);
                }
            }
        }
        self.update_gauge();
    }

    /// Retrieving the blob from `from` failed for reasons unrelated to its content.
    pub fn on_fetch_failed(&mut self, hash: &Hash, from: PeerId) {
        let Some(entry) = self.entries.get_mut(hash) else {
            return;
        };
        if entry.state != (WantState::Fetching { from }) {
            return;
        }
        entry.hints.remove(&from);
        entry.state = WantState::Wanted;
        self.try_fetch(hash);
    }

    pub fn peer_up(&mut self, peer: PeerId) {
        if !self.peers.insert(peer) {
            return;
        }
        let mut retry = Vec::new();
        for (hash, entry) in self.entries.iter() {
            if entry.state != WantState::Wanted {
                continue;
            }
            if entry.hints.is_empty() {
                self.actions.push(OutEvent::Announce {
                    blob: entry.blob,
                    peers: vec![peer],
                });
            } else if entry.hints.contains(&peer) {
                retry.push(*hash);
            }
        }
        for hash in retry {
            self.try_fetch(&hash);
        }
    }

    pub fn peer_down(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    /// Gives up on every running retrieval.
    pub fn shutdown(&mut self) {
        for entry in self.entries.values_mut() {
            if let WantState::Fetching { .. } = entry.state {
                entry.state = WantState::Expired;
                self.metrics.wants_expired.inc();
            }
        }
        self.peers.clear();
        self.update_gauge();
    }

    /// Starts retrieving a wanted blob from a connected peer that has it.
    fn try_fetch(&mut self, hash: &Hash) {
        let Some(entry) = self.entries.get_mut(hash) else {
            return;
        };
        if entry.state != WantState::Wanted {
            return;
        }
        let from = entry
            .hints
            .iter()
            .find(|peer| self.peers.contains(*peer) && !entry.skip.contains(*peer))
            .copied();
        if let Some(from) = from {
            entry.state = WantState::Fetching { from };
            self.actions.push(OutEvent::StartFetch {
                blob: entry.blob,
                from,
            });
        }
    }

    fn update_gauge(&self) {
        let outstanding = self
            .entries
            .values()
            .filter(|entry| entry.state.is_live())
            .count();
        self.metrics.outstanding.set(outstanding as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::peer;

    const MAX: u64 = 1024;

    fn state() -> State {
        State::new(MAX, 2, Default::default())
    }

    fn events(state: &mut State) -> Vec<OutEvent> {
        state.events().collect()
    }

    #[test]
    fn oversized_want_is_dropped() {
        let mut state = state();
        state.peer_up(peer(1));
        let blob = BlobRef::of(b"x").with_size(MAX + 1);
        state.want(blob, Some(peer(1)));
        assert_eq!(state.get(&blob.hash()).unwrap().state(), WantState::Dropped);
        assert!(events(&mut state).is_empty());
        assert_eq!(state.metrics.blobs_dropped.get(), 1);
        assert_eq!(state.metrics.events.get(), 1);

        // terminal, a later have does not revive it
        state.have(blob, peer(1), 1);
        assert_eq!(state.get(&blob.hash()).unwrap().state(), WantState::Dropped);
        assert!(events(&mut state).is_empty());
    }

    #[test]
    fn oversized_have_counts_one_event() {
        let mut state = state();
        let blob = BlobRef::of(b"x");
        state.want(blob, None);
        assert_eq!(state.metrics.events.get(), 1);

        state.have(blob, peer(1), MAX + 1);
        let entry = state.get(&blob.hash()).unwrap();
        assert_eq!(entry.state(), WantState::Dropped);
        assert!(events(&mut state).is_empty());
        assert_eq!(state.metrics.events.get(), 2);
        assert_eq!(state.metrics.blobs_dropped.get(), 1);
        assert_eq!(state.metrics.outstanding.get(), 0);
    }

    #[test]
    fn want_announces_then_fetches_on_have() {
        let mut state = state();
        state.peer_up(peer(1));
        state.peer_up(peer(2));
        let blob = BlobRef::of(b"content");
        state.want(blob, None);
        assert_eq!(
            events(&mut state),
            vec![OutEvent::Announce {
                blob,
                peers: {
                    let mut peers = vec![peer(1), peer(2)];
                    peers.sort();
                    peers
                },
            }]
        );
        assert_eq!(state.metrics.outstanding.get(), 1);

        state.have(blob, peer(2), 7);
        assert_eq!(
            events(&mut state),
            vec![OutEvent::StartFetch {
                blob,
                from: peer(2)
            }]
        );
        // a second have does not start another retrieval
        state.have(blob, peer(1), 7);
        assert!(events(&mut state).is_empty());
        let entry = state.get(&blob.hash()).unwrap();
        assert_eq!(entry.state(), WantState::Fetching { from: peer(2) });
        assert_eq!(entry.hints().len(), 2);
    }

    #[test]
    fn repeated_wants_merge_hints() {
        let mut state = state();
        let blob = BlobRef::of(b"content");
        state.want(blob, Some(peer(1)));
        state.want(blob, Some(peer(2)));
        state.want(blob, None);
        assert_eq!(state.snapshot().len(), 1);
        assert_eq!(state.get(&blob.hash()).unwrap().hints().len(), 2);
        assert_eq!(state.metrics.wants_issued.get(), 1);
        // no peer is connected, so nothing happens
        assert!(events(&mut state).is_empty());

        state.peer_up(peer(2));
        assert_eq!(
            events(&mut state),
            vec![OutEvent::StartFetch {
                blob,
                from: peer(2)
            }]
        );
    }

    #[test]
    fn hintless_wants_are_announced_to_new_peers() {
        let mut state = state();
        let blob = BlobRef::of(b"lonely");
        state.want(blob, None);
        assert!(events(&mut state).is_empty());
        state.peer_up(peer(3));
        assert_eq!(
            events(&mut state),
            vec![OutEvent::Announce {
                blob,
                peers: vec![peer(3)]
            }]
        );
    }

    #[test]
    fn failed_fetch_moves_to_next_hint() {
        let mut state = state();
        state.peer_up(peer(1));
        state.peer_up(peer(2));
        let blob = BlobRef::of(b"content");
        state.want(blob, Some(peer(1)));
        state.want(blob, Some(peer(2)));
        let _ = events(&mut state);
        let first = match state.get(&blob.hash()).unwrap().state() {
            WantState::Fetching { from } => from,
            other => panic!("unexpected state {other:?}"),
        };
        state.on_fetch_failed(&blob.hash(), first);
        let second = if first == peer(1) { peer(2) } else { peer(1) };
        assert_eq!(
            events(&mut state),
            vec![OutEvent::StartFetch { blob, from: second }]
        );

        // stale failure reports are ignored
        state.on_fetch_failed(&blob.hash(), first);
        assert!(events(&mut state).is_empty());

        state.on_fetch_failed(&blob.hash(), second);
        assert_eq!(state.get(&blob.hash()).unwrap().state(), WantState::Wanted);
    }

    #[test]
    fn verification_failures_expire() {
        let mut state = state();
        state.peer_up(peer(1));
        state.peer_up(peer(2));
        let blob = BlobRef::of(b"content");
        let bad = Rejection::HashMismatch {
            actual: Hash::new(b"other"),
        };

        state.have(blob, peer(1), 7);
        state.want(blob, None);
        state.have(blob, peer(1), 7);
        let _ = events(&mut state);
        state.on_rejected(&blob.hash(), Some(peer(1)), bad);
        let entry = state.get(&blob.hash()).unwrap();
        assert_eq!(entry.state(), WantState::Wanted);
        assert_eq!(entry.verify_failures(), 1);
        assert!(!entry.hints().contains(&peer(1)));
        assert!(events(&mut state).is_empty());

        // the peer that sent bad content is not asked again
        state.have(blob, peer(1), 7);
        assert!(events(&mut state).is_empty());

        state.have(blob, peer(2), 7);
        assert_eq!(
            events(&mut state),
            vec![OutEvent::StartFetch {
                blob,
                from: peer(2)
            }]
        );
        state.on_rejected(&blob.hash(), Some(peer(2)), bad);
        assert_eq!(state.get(&blob.hash()).unwrap().state(), WantState::Expired);
        assert_eq!(state.metrics.wants_expired.get(), 1);
        assert_eq!(state.metrics.verification_failures.get(), 2);
        assert_eq!(state.metrics.outstanding.get(), 0);
    }

    #[test]
    fn external_resolve_cancels_fetch() {
        let mut state = state();
        state.peer_up(peer(1));
        let blob = BlobRef::of(b"content");
        state.want(blob, Some(peer(1)));
        let _ = events(&mut state);
        assert!(state.is_fetching_from(&blob.hash(), &peer(1)));

        let entry = state.on_resolved(&blob.hash()).unwrap();
        assert_eq!(entry.state(), WantState::Resolved);
        assert_eq!(
            events(&mut state),
            vec![OutEvent::CancelFetch { hash: blob.hash() }]
        );
        assert!(state.snapshot().is_empty());
        assert!(!state.is_fetching_from(&blob.hash(), &peer(1)));
    }

    #[test]
    fn shutdown_expires_fetching() {
        let mut state = state();
        state.peer_up(peer(1));
        let fetching = BlobRef::of(b"one");
        let waiting = BlobRef::of(b"two");
        state.want(fetching, Some(peer(1)));
        state.want(waiting, None);
        let _ = events(&mut state);
        state.shutdown();
        assert_eq!(state.get(&fetching.hash()).unwrap().state(), WantState::Expired);
        assert_eq!(state.get(&waiting.hash()).unwrap().state(), WantState::Wanted);
    }

    #[test]
    fn content_checks() {
        let blob = BlobRef::of(b"hello");
        assert_eq!(check_content(&blob, b"hello", 5), Ok(()));
        assert_eq!(
            check_content(&blob, b"hello", 4),
            Err(Rejection::TooLarge { size: 5, max: 4 })
        );
        assert!(matches!(
            check_content(&blob, b"hellO", 5),
            Err(Rejection::HashMismatch { .. })
        ));
    }
}
