//! Iterative lookup state.
//!
//! A shortlist of candidate peers kept sorted by XOR distance to the
//! target. Each round takes up to alpha unqueried peers off the front,
//! merges whatever they return, and the caller terminates when a round no
//! longer improves the closest known peer or the k closest have all been
//! queried.

use std::collections::HashSet;

use pando_core::{NodeId, PeerHandle, ID_LEN};

/// Candidate set for one iterative lookup.
pub struct Shortlist {
    target: NodeId,
    entries: Vec<PeerHandle>,
    queried: HashSet<NodeId>,
    k: usize,
    alpha: usize,
}

impl Shortlist {
    /// Creates a shortlist seeded from the local routing table.
    pub fn new(target: NodeId, initial: Vec<PeerHandle>, k: usize, alpha: usize) -> Self {
        let mut list = Self {
            target,
            entries: Vec::new(),
            queried: HashSet::new(),
            k,
            alpha,
        };
        list.merge(initial);
        list
    }

    /// Returns up to alpha unqueried peers, closest first, marking them
    /// queried.
    pub fn next_batch(&mut self) -> Vec<PeerHandle> {
        let mut batch = Vec::new();
        for entry in &self.entries {
            if !self.queried.contains(&entry.node_id) {
                batch.push(entry.clone());
                if batch.len() >= self.alpha {
                    break;
                }
            }
        }
        for entry in &batch {
            self.queried.insert(entry.node_id);
        }
        batch
    }

    /// Merges newly discovered peers, keeping the list sorted by distance
    /// and trimmed to k.
    pub fn merge(&mut self, found: Vec<PeerHandle>) {
        for peer in found {
            if !self.entries.iter().any(|e| e.node_id == peer.node_id) {
                self.entries.push(peer);
            }
        }
        let target = self.target;
        self.entries
            .sort_by(|a, b| target.distance(&a.node_id.0).cmp(&target.distance(&b.node_id.0)));
        self.entries.truncate(self.k);
    }

    /// Distance of the closest known peer, if any.
    pub fn best_distance(&self) -> Option<[u8; ID_LEN]> {
        self.entries
            .first()
            .map(|e| self.target.distance(&e.node_id.0))
    }

    /// Returns true when every one of the k closest known peers has been
    /// queried.
    pub fn is_complete(&self) -> bool {
        self.entries
            .iter()
            .take(self.k)
            .all(|e| self.queried.contains(&e.node_id))
    }

    /// Consumes the shortlist, yielding the k closest peers found.
    pub fn into_result(self) -> Vec<PeerHandle> {
        self.entries
    }
}
