//! Pando Store - Local content-addressable storage engine.
//!
//! Turns files into digest-addressed chunks and back:
//! - Deterministic chunking with stripe-aligned zero padding
//! - Per-stripe Reed-Solomon parity via `pando-codec`
//! - Raw chunk blobs named by digest under the storage directory
//! - An atomically replaced `index.json` mapping file digest to record
//!
//! Every operation here is synchronous; async callers dispatch through a
//! blocking pool.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod blob;
pub mod config;
pub mod index;
pub mod store;

pub use blob::{BlobStore, BlobStoreStats};
pub use config::StoreConfig;
pub use index::FileIndex;
pub use store::ChunkStore;

use pando_core::Digest;
use thiserror::Error;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk index is unreadable or from an incompatible format
    #[error("corrupt index: {0}")]
    Corrupt(String),

    /// No record for the requested file digest
    #[error("file not found: {0}")]
    FileNotFound(Digest),

    /// No blob for the requested chunk digest
    #[error("chunk not found: {0}")]
    ChunkNotFound(Digest),

    /// A data chunk referenced by a record is absent locally
    #[error("missing chunk: {0}")]
    MissingChunk(Digest),

    /// Bytes do not hash to the digest they were presented under
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the bytes were requested or offered under.
        expected: Digest,
        /// The digest the bytes actually hash to.
        actual: Digest,
    },

    /// Invalid erasure or chunking parameters
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Erasure coding failure
    #[error(transparent)]
    Codec(#[from] pando_codec::CodecError),
}
