//! Pando Wire - Point-to-point chunk and metadata transfer.
//!
//! A framed request/response protocol over TCP: every message is a 4-byte
//! big-endian length prefix followed by a JSON object, and chunk payloads
//! stream raw after a `CHUNK_START` header. The server side serves through
//! a read-only [`ChunkProvider`] capability rather than holding the whole
//! engine; the client side enforces deadlines and verifies every chunk
//! digest before handing bytes back.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod codec;
pub mod server;

pub use client::WireClient;
pub use server::WireServer;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use pando_core::Digest;
use pando_proto::{FileRecord, FrameError, WireErrorCode};

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on concurrently served connections.
pub const DEFAULT_MAX_SERVE_CONCURRENCY: usize = 64;

/// Default upper bound on an announced chunk payload size.
pub const DEFAULT_MAX_CHUNK_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// The request deadline elapsed
    #[error("transport timeout")]
    Timeout,

    /// The stream ended before the announced payload arrived
    #[error("short read: expected {expected} payload bytes, got {got}")]
    ShortRead {
        /// Bytes the `CHUNK_START` header announced.
        expected: u64,
        /// Bytes actually received.
        got: u64,
    },

    /// The announced payload exceeds the permitted size
    #[error("payload of {size} bytes exceeds cap of {max}")]
    Overflow {
        /// Announced size.
        size: u64,
        /// Configured cap.
        max: u64,
    },

    /// Received bytes do not hash to the requested digest
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The requested chunk digest.
        expected: Digest,
        /// What the payload hashed to.
        actual: Digest,
    },

    /// The peer answered with an `ERROR` message
    #[error("remote error {code:?}: {message}")]
    Remote {
        /// Failure class reported by the peer.
        code: WireErrorCode,
        /// Peer-supplied detail.
        message: String,
    },

    /// The peer sent a response of an unexpected type
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Framing failure
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// IO failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Returns true if the peer reported the object as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WireError::Remote {
                code: WireErrorCode::NotFound,
                ..
            }
        )
    }
}

/// Read-only capability handed to the server.
///
/// The transport never sees the engine; it pulls chunk bytes and records
/// through this seam only.
#[async_trait]
pub trait ChunkProvider: Send + Sync + 'static {
    /// Returns the bytes of a locally held chunk.
    async fn chunk(&self, digest: &Digest) -> Option<Vec<u8>>;

    /// Returns the record of a locally held file.
    async fn file_record(&self, digest: &Digest) -> Option<FileRecord>;

    /// Returns every locally held file record.
    async fn file_records(&self) -> Vec<FileRecord>;
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Cap on concurrently served connections; further accepts block.
    pub max_serve_concurrency: usize,
    /// Per-request client deadline.
    pub request_timeout: Duration,
    /// Upper bound accepted for an announced chunk payload.
    pub max_chunk_payload: u64,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_serve_concurrency: DEFAULT_MAX_SERVE_CONCURRENCY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_chunk_payload: DEFAULT_MAX_CHUNK_PAYLOAD,
        }
    }
}
