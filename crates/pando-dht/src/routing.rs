//! Kademlia routing table.
//!
//! Organizes known peers by XOR distance from the local node id: bucket `i`
//! holds peers whose distance has its highest set bit at position `i`.
//! Buckets keep least-recently-seen order; a full bucket only admits a
//! newcomer after the stalest entry fails a liveness check, which the
//! service layer drives through [`InsertOutcome`].

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use rand::RngCore;

use pando_core::{NodeId, PeerHandle, ID_LEN};

use crate::{BUCKET_COUNT, DEFAULT_K, MAX_PEER_FAILURES};

/// A peer tracked by the routing table.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// The peer's handle (DHT endpoint).
    pub handle: PeerHandle,
    /// When the peer was last observed in any RPC.
    pub last_seen: Instant,
    /// Consecutive failed RPCs.
    pub failures: u32,
}

impl PeerEntry {
    fn new(handle: PeerHandle) -> Self {
        Self {
            handle,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }
}

/// Result of offering a peer to the table.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// The peer was already present and moved to most-recently-seen.
    Updated,
    /// The peer was appended to a non-full bucket.
    Added,
    /// The bucket is full. The caller should ping `least_recent`; if it
    /// answers, discard the newcomer, otherwise evict it via
    /// [`RoutingTable::replace`].
    Full {
        /// The stalest occupant of the target bucket.
        least_recent: PeerHandle,
    },
    /// The peer is the local node and is never tracked.
    Rejected,
}

#[derive(Debug, Default)]
struct Bucket {
    // Least-recently-seen first.
    peers: VecDeque<PeerEntry>,
}

/// The routing table: 160 buckets with a per-bucket lock.
pub struct RoutingTable {
    local_id: NodeId,
    bucket_size: usize,
    buckets: Vec<Mutex<Bucket>>,
}

impl RoutingTable {
    /// Creates a table for `local_id` with the conventional bucket size.
    pub fn new(local_id: NodeId) -> Self {
        Self::with_bucket_size(local_id, DEFAULT_K)
    }

    /// Creates a table with a custom bucket size.
    pub fn with_bucket_size(local_id: NodeId, bucket_size: usize) -> Self {
        Self {
            local_id,
            bucket_size,
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Bucket::default())).collect(),
        }
    }

    /// Returns the local node id.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Bucket index for a peer: position of the highest set bit of the
    /// distance. `None` for the local id itself.
    pub fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        if *node_id == self.local_id {
            return None;
        }
        let distance = self.local_id.distance(&node_id.0);
        let leading = NodeId::new(distance).leading_zeros() as usize;
        Some(BUCKET_COUNT - 1 - leading)
    }

    /// Offers a peer observed in an RPC.
    pub fn observe(&self, handle: PeerHandle) -> InsertOutcome {
        let Some(index) = self.bucket_index(&handle.node_id) else {
            return InsertOutcome::Rejected;
        };
        let mut bucket = self.buckets[index].lock();

        if let Some(pos) = bucket
            .peers
            .iter()
            .position(|p| p.handle.node_id == handle.node_id)
        {
            let mut entry = bucket.peers.remove(pos).expect("position just found");
            entry.touch();
            entry.handle = handle;
            bucket.peers.push_back(entry);
            return InsertOutcome::Updated;
        }

        if bucket.peers.len() < self.bucket_size {
            bucket.peers.push_back(PeerEntry::new(handle));
            return InsertOutcome::Added;
        }

        let least_recent = bucket.peers.front().expect("bucket is full").handle.clone();
        InsertOutcome::Full { least_recent }
    }

    /// Evicts `stale` and inserts `newcomer` in its place, if `stale` is
    /// still present. Called after a failed liveness check.
    pub fn replace(&self, stale: &NodeId, newcomer: PeerHandle) {
        let Some(index) = self.bucket_index(stale) else {
            return;
        };
        let mut bucket = self.buckets[index].lock();
        if let Some(pos) = bucket.peers.iter().position(|p| p.handle.node_id == *stale) {
            bucket.peers.remove(pos);
            if let Some(new_index) = self.bucket_index(&newcomer.node_id) {
                if new_index == index && bucket.peers.len() < self.bucket_size {
                    bucket.peers.push_back(PeerEntry::new(newcomer));
                }
            }
        }
    }

    /// Marks a peer as fresh after a successful RPC.
    pub fn touch(&self, node_id: &NodeId) {
        if let Some(index) = self.bucket_index(node_id) {
            let mut bucket = self.buckets[index].lock();
            if let Some(pos) = bucket.peers.iter().position(|p| p.handle.node_id == *node_id) {
                let mut entry = bucket.peers.remove(pos).expect("position just found");
                entry.touch();
                bucket.peers.push_back(entry);
            }
        }
    }

    /// Records a failed RPC; the peer is evicted after three consecutive
    /// failures. Returns true if it was evicted.
    pub fn record_failure(&self, node_id: &NodeId) -> bool {
        let Some(index) = self.bucket_index(node_id) else {
            return false;
        };
        let mut bucket = self.buckets[index].lock();
        if let Some(pos) = bucket.peers.iter().position(|p| p.handle.node_id == *node_id) {
            let entry = &mut bucket.peers[pos];
            entry.failures += 1;
            if entry.failures >= MAX_PEER_FAILURES {
                bucket.peers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Removes a peer outright.
    pub fn remove(&self, node_id: &NodeId) {
        if let Some(index) = self.bucket_index(node_id) {
            let mut bucket = self.buckets[index].lock();
            bucket.peers.retain(|p| p.handle.node_id != *node_id);
        }
    }

    /// Returns the `count` peers closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<PeerHandle> {
        let mut peers: Vec<PeerHandle> = self
            .buckets
            .iter()
            .flat_map(|b| b.lock().peers.iter().map(|p| p.handle.clone()).collect::<Vec<_>>())
            .collect();
        peers.sort_by(|a, b| {
            target
                .distance(&a.node_id.0)
                .cmp(&target.distance(&b.node_id.0))
        });
        peers.truncate(count);
        peers
    }

    /// Returns the total number of tracked peers.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().peers.len()).sum()
    }

    /// Returns true if no peers are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of buckets currently holding at least one peer.
    pub fn non_empty_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.lock().peers.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// A uniformly random id falling into bucket `index`, used for bucket
    /// refresh lookups.
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        // Bit position of the first differing bit, counted from the MSB.
        let diff_bit = BUCKET_COUNT - 1 - index;
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);

        // Prefix bits above diff_bit match the local id; the diff bit is
        // flipped; everything below is random.
        let local = self.local_id.as_bytes();
        let mut id = [0u8; ID_LEN];
        for byte in 0..ID_LEN {
            let mut value = 0u8;
            for bit_in_byte in 0..8 {
                let bit = byte * 8 + bit_in_byte;
                let mask = 0x80u8 >> bit_in_byte;
                let set = match bit.cmp(&diff_bit) {
                    std::cmp::Ordering::Less => local[byte] & mask != 0,
                    std::cmp::Ordering::Equal => local[byte] & mask == 0,
                    std::cmp::Ordering::Greater => bytes[byte] & mask != 0,
                };
                if set {
                    value |= mask;
                }
            }
            id[byte] = value;
        }
        NodeId::new(id)
    }
}
