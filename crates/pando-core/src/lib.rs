//! Pando Core - Core types and primitives for the pando distribution network.
//!
//! This crate provides:
//! - Content digests (SHA-256, hex textual form)
//! - DHT identifiers (160-bit node ids and keys, XOR distance)
//! - Peer handles
//! - Timestamps

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod digest;
pub mod id;
pub mod peer;
pub mod time;

pub use digest::Digest;
pub use id::{Key, NodeId};
pub use peer::PeerHandle;
pub use time::Timestamp;

/// Length of a content digest in bytes (SHA-256).
pub const DIGEST_LEN: usize = 32;

/// Length of a DHT identifier in bytes (160 bits).
pub const ID_LEN: usize = 20;

/// Default chunking unit in bytes.
pub const DEFAULT_CHUNK_SIZE: u32 = 65_536;
