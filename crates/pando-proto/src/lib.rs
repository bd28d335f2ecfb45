//! Pando Proto - Protocol types for the pando distribution network.
//!
//! Defines the JSON schemas that cross process boundaries:
//! - `FileRecord` - per-file metadata (also the `index.json` entry format)
//! - Wire messages - framed request/response protocol for chunk transfer
//! - DHT datagrams - the UDP overlay RPC envelope
//!
//! Unknown JSON fields are ignored on receipt for forward compatibility.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod dht;
pub mod frame;
pub mod record;
pub mod wire;

pub use dht::{Datagram, DatagramBody};
pub use frame::{decode_frame, encode_frame, FrameError};
pub use record::FileRecord;
pub use wire::{WireErrorCode, WireRequest, WireResponse};

/// Maximum encoded size of a single framed wire message in bytes.
///
/// Chunk payloads are streamed raw after a `CHUNK_START` header and are not
/// subject to this limit.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// Maximum encoded size of a DHT datagram (UDP payload budget).
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Maximum peers carried in a single `NODES` datagram; longer lists are
/// fragmented across datagrams sharing the transaction id.
pub const MAX_NODES_PER_DATAGRAM: usize = 32;
