//! Leader selection by rendezvous hashing over the sorted replicator set.
//!
//! Every peer that sees the same sorted replicator list picks the same
//! leaders for a subject: the subject's SHA-256 digest picks a start slot and
//! the leaders are the next `n` peers around the ring.

use mdrl_log::Hash;

/// Picks `min(n, peers)` leaders for `subject` from an already sorted list.
pub fn find_leaders(sorted_peers: &[String], subject: &str, n: usize) -> Vec<String> {
    if sorted_peers.is_empty() {
        return Vec::new();
    }
    let len = sorted_peers.len();
    let start = (Hash::digest(subject.as_bytes()).tail_u64() % len as u64) as usize;
    (0..n.min(len))
        .map(|i| sorted_peers[(start + i) % len].clone())
        .collect()
}

/// Decides which replicators may be chosen as leaders.
pub trait TrustFilter: Send + Sync {
    fn is_trusted(&self, peer: &str) -> bool;
}

impl<F> TrustFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_trusted(&self, peer: &str) -> bool {
        self(peer)
    }
}

/// Sorted, deduplicated set of peers replicating one program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicatorSet {
    peers: Vec<String>,
}

impl ReplicatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the peer was already present.
    pub fn insert(&mut self, peer: &str) -> bool {
        match self.peers.binary_search_by(|p| p.as_str().cmp(peer)) {
            Ok(_) => false,
            Err(index) => {
                self.peers.insert(index, peer.to_string());
                true
            }
        }
    }

    pub fn remove(&mut self, peer: &str) -> bool {
        match self.peers.binary_search_by(|p| p.as_str().cmp(peer)) {
            Ok(index) => {
                self.peers.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.peers.binary_search_by(|p| p.as_str().cmp(peer)).is_ok()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// The set plus `me` when given, keeping only trusted peers. `me` is
    /// never filtered out.
    pub fn candidates(&self, me: Option<&str>, trust: Option<&dyn TrustFilter>) -> Vec<String> {
        let mut set = self.clone();
        if let Some(me) = me {
            set.insert(me);
        }
        set.peers
            .into_iter()
            .filter(|p| Some(p.as_str()) == me || trust.map_or(true, |t| t.is_trusted(p)))
            .collect()
    }
}
