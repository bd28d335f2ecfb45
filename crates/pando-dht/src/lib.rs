//! Pando DHT - Kademlia overlay.
//!
//! Implements the discovery layer of the network:
//! - Routing table over 160-bit XOR distance
//! - `PING` / `FIND_NODE` / `FIND_VALUE` / `STORE` RPCs over UDP JSON datagrams
//! - Iterative lookups with bounded parallelism
//! - TTL-bounded value storage with periodic republish
//!
//! Peer handles held in the routing table carry the peer's DHT (UDP)
//! endpoint; values stored under `chunk:`/`file:` keys carry whatever
//! endpoint their publisher chose, typically the chunk-serving one.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod lookup;
pub mod node;
pub mod routing;
pub mod store;

pub use node::{DhtConfig, DhtNode};
pub use routing::{InsertOutcome, PeerEntry, RoutingTable};
pub use store::{DhtStore, DhtStoreConfig};

use thiserror::Error;

/// Bucket size and replication factor (k).
pub const DEFAULT_K: usize = 20;

/// Lookup parallelism (alpha).
pub const DEFAULT_ALPHA: usize = 3;

/// Number of buckets, one per possible distance prefix length.
pub const BUCKET_COUNT: usize = 160;

/// Default single-RPC timeout in seconds.
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 5;

/// Default end-to-end iterative lookup deadline in seconds.
pub const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 20;

/// Default value TTL in seconds; publishers re-announce at half this.
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Default bucket refresh interval in seconds.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 3600;

/// Consecutive RPC failures after which a peer is evicted.
pub const MAX_PEER_FAILURES: u32 = 3;

/// Default cap on records in the local value store.
pub const DEFAULT_MAX_RECORDS: usize = 100_000;

/// Default cap on entries kept when merging list-valued records.
pub const DEFAULT_MAX_LIST_VALUE: usize = 64;

/// Hard ceiling accepted for a requested TTL.
pub const MAX_TTL_SECS: u64 = 86_400;

/// Errors from overlay operations.
#[derive(Debug, Error)]
pub enum DhtError {
    /// An RPC went unanswered within the timeout
    #[error("rpc timeout")]
    Timeout,

    /// Socket failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Datagram could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The peer answered with an unexpected datagram type
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The node is shutting down
    #[error("shutting down")]
    Shutdown,
}
