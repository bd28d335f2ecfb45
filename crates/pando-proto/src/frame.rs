//! Message framing: 4-byte big-endian length prefix + UTF-8 JSON payload.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::MAX_FRAME_LEN;

/// Size of the length prefix in bytes.
pub const LEN_PREFIX: usize = 4;

/// Errors encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not enough bytes buffered for a complete frame
    #[error("need more bytes")]
    NeedMore,

    /// Frame exceeds the maximum permitted length
    #[error("frame of {0} bytes exceeds maximum")]
    TooLarge(u32),

    /// JSON serialization failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a message into a single frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(msg)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut out = Vec::with_capacity(LEN_PREFIX + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decodes one frame from the front of `bytes`.
///
/// Returns the message and the number of bytes consumed. `NeedMore` means
/// the caller should read further input and retry.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameError> {
    if bytes.len() < LEN_PREFIX {
        return Err(FrameError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let len = len as usize;
    if bytes.len() < LEN_PREFIX + len {
        return Err(FrameError::NeedMore);
    }
    let msg = serde_json::from_slice(&bytes[LEN_PREFIX..LEN_PREFIX + len])?;
    Ok((msg, LEN_PREFIX + len))
}
