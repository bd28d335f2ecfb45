//! Async frame IO over a byte stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use pando_proto::{encode_frame, FrameError, MAX_FRAME_LEN};

use crate::WireError;

/// Writes one framed message to the stream.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message from the stream.
///
/// Returns `Ok(None)` on a clean end of stream before any prefix byte.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len).into());
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let msg = serde_json::from_slice(&payload).map_err(FrameError::Json)?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pando_core::Digest;
    use pando_proto::{WireRequest, WireResponse};

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let req = WireRequest::GetChunk {
            chunk_hash: Digest::of(b"payload"),
        };
        write_frame(&mut a, &req).await.unwrap();

        let got: WireRequest = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got, req);
    }

    #[tokio::test]
    async fn test_eof_before_prefix_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let got: Option<WireResponse> = read_frame(&mut b).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Announce 100 bytes but close after 2.
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{}").await.unwrap();
        drop(a);

        let err = read_frame::<_, WireRequest>(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }
}
