//! Pando Engine - The concurrent peer node.
//!
//! Composes the chunk store, erasure codec, wire transport and DHT into the
//! product behaviour:
//! - `PeerEngine` advertises local content, serves chunk requests, and
//!   fetches files from the network with erasure recovery
//! - `NodeSupervisor` owns the lifecycle: ordered startup, the top-level
//!   cancellation signal, and graceful shutdown

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod engine;
pub mod fetch;
pub mod supervisor;

pub use config::EngineConfig;
pub use engine::PeerEngine;
pub use supervisor::NodeSupervisor;

use pando_core::Digest;
use thiserror::Error;

/// Errors crossing the supervisor boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The file's record could not be found locally or in the DHT
    #[error("file not found: {0}")]
    FileNotFound(Digest),

    /// Fewer than k shards of some stripe could be obtained
    #[error("unrecoverable: stripe {stripe} has {available} of {required} required shards")]
    Unrecoverable {
        /// Index of the failed stripe.
        stripe: usize,
        /// Valid shards obtained.
        available: usize,
        /// Shards needed for reconstruction.
        required: usize,
    },

    /// Invalid configuration; fatal at startup
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Storage failure
    #[error(transparent)]
    Store(#[from] pando_store::StoreError),

    /// Transport failure surfaced past per-peer retries
    #[error(transparent)]
    Wire(#[from] pando_wire::WireError),

    /// Overlay failure surfaced past lookup retries
    #[error(transparent)]
    Dht(#[from] pando_dht::DhtError),

    /// A background task failed unexpectedly
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::Internal(e.to_string())
    }
}
