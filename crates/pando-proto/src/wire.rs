//! Point-to-point wire messages for chunk and metadata transfer.
//!
//! Every message travels as a length-prefixed JSON frame (see
//! [`crate::frame`]). A `CHUNK_START` response is followed by exactly
//! `size` raw payload bytes on the same connection.

use serde::{Deserialize, Serialize};

use crate::record::FileRecord;
use pando_core::Digest;

/// Requests a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireRequest {
    /// Fetch the bytes of one chunk.
    #[serde(rename = "GET_CHUNK")]
    GetChunk {
        /// Digest of the requested chunk.
        chunk_hash: Digest,
    },

    /// Fetch the metadata record of one file.
    #[serde(rename = "GET_FILE_METADATA")]
    GetFileMetadata {
        /// Digest of the requested file.
        file_hash: Digest,
    },

    /// List every file record the peer holds.
    #[serde(rename = "LIST_FILES")]
    ListFiles {},
}

/// Responses a server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireResponse {
    /// Header preceding `size` raw bytes of chunk payload.
    #[serde(rename = "CHUNK_START")]
    ChunkStart {
        /// Exact byte length of the payload that follows.
        size: u64,
    },

    /// A file metadata record.
    #[serde(rename = "FILE_METADATA")]
    FileMetadata {
        /// The record itself, flattened into the message object.
        #[serde(flatten)]
        record: FileRecord,
    },

    /// Every file record the serving peer holds.
    #[serde(rename = "FILE_LIST")]
    FileList {
        /// The records.
        files: Vec<FileRecord>,
    },

    /// Request failed.
    #[serde(rename = "ERROR")]
    Error {
        /// Machine-readable failure class.
        code: WireErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

/// Failure classes carried in `ERROR` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireErrorCode {
    /// The request was malformed or of an unknown type.
    BadRequest,
    /// The requested chunk or file is not held by this peer.
    NotFound,
    /// Any other failure.
    Internal,
}

// Codes from future peers must not break parsing; anything unknown
// degrades to `Internal`.
impl<'de> serde::Deserialize<'de> for WireErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(match code.as_str() {
            "BAD_REQUEST" => WireErrorCode::BadRequest,
            "NOT_FOUND" => WireErrorCode::NotFound,
            _ => WireErrorCode::Internal,
        })
    }
}
