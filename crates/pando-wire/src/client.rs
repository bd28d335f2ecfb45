//! The requesting side of the wire protocol.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use pando_core::Digest;
use pando_proto::{FileRecord, WireRequest, WireResponse};

use crate::codec::{read_frame, write_frame};
use crate::{WireError, DEFAULT_MAX_CHUNK_PAYLOAD, DEFAULT_REQUEST_TIMEOUT};

/// Dials peers and issues single requests.
///
/// One connection per request; every chunk is digest-verified before it is
/// returned, so a corrupted payload can never reach a cache.
#[derive(Debug, Clone)]
pub struct WireClient {
    request_timeout: Duration,
    max_chunk_payload: u64,
}

impl Default for WireClient {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_chunk_payload: DEFAULT_MAX_CHUNK_PAYLOAD,
        }
    }
}

impl WireClient {
    /// Creates a client with a custom deadline and payload cap.
    pub fn new(request_timeout: Duration, max_chunk_payload: u64) -> Self {
        Self {
            request_timeout,
            max_chunk_payload,
        }
    }

    /// Fetches one chunk from `endpoint` and verifies its digest.
    pub async fn fetch_chunk(
        &self,
        endpoint: &str,
        chunk_hash: &Digest,
    ) -> Result<Vec<u8>, WireError> {
        timeout(
            self.request_timeout,
            self.fetch_chunk_inner(endpoint, chunk_hash),
        )
        .await
        .map_err(|_| WireError::Timeout)?
    }

    async fn fetch_chunk_inner(
        &self,
        endpoint: &str,
        chunk_hash: &Digest,
    ) -> Result<Vec<u8>, WireError> {
        let mut stream = TcpStream::connect(endpoint).await?;
        write_frame(
            &mut stream,
            &WireRequest::GetChunk {
                chunk_hash: *chunk_hash,
            },
        )
        .await?;

        let size = match read_frame::<_, WireResponse>(&mut stream).await? {
            Some(WireResponse::ChunkStart { size }) => size,
            Some(WireResponse::Error { code, message }) => {
                return Err(WireError::Remote { code, message })
            }
            Some(other) => {
                return Err(WireError::UnexpectedResponse(format!("{other:?}")));
            }
            None => {
                return Err(WireError::ShortRead {
                    expected: 0,
                    got: 0,
                })
            }
        };

        if size > self.max_chunk_payload {
            return Err(WireError::Overflow {
                size,
                max: self.max_chunk_payload,
            });
        }

        let mut payload = vec![0u8; size as usize];
        let mut read = 0usize;
        while read < payload.len() {
            match stream.read(&mut payload[read..]).await? {
                0 => {
                    return Err(WireError::ShortRead {
                        expected: size,
                        got: read as u64,
                    })
                }
                n => read += n,
            }
        }

        let actual = Digest::of(&payload);
        if actual != *chunk_hash {
            return Err(WireError::DigestMismatch {
                expected: *chunk_hash,
                actual,
            });
        }

        debug!(digest = %chunk_hash, size, endpoint, "fetched chunk");
        Ok(payload)
    }

    /// Fetches a file's metadata record from `endpoint`.
    pub async fn fetch_metadata(
        &self,
        endpoint: &str,
        file_hash: &Digest,
    ) -> Result<FileRecord, WireError> {
        timeout(self.request_timeout, async {
            let mut stream = TcpStream::connect(endpoint).await?;
            write_frame(
                &mut stream,
                &WireRequest::GetFileMetadata {
                    file_hash: *file_hash,
                },
            )
            .await?;

            match read_frame::<_, WireResponse>(&mut stream).await? {
                Some(WireResponse::FileMetadata { record }) => Ok(record),
                Some(WireResponse::Error { code, message }) => {
                    Err(WireError::Remote { code, message })
                }
                Some(other) => Err(WireError::UnexpectedResponse(format!("{other:?}"))),
                None => Err(WireError::ShortRead {
                    expected: 0,
                    got: 0,
                }),
            }
        })
        .await
        .map_err(|_| WireError::Timeout)?
    }

    /// Lists every file record `endpoint` holds.
    pub async fn list_files(&self, endpoint: &str) -> Result<Vec<FileRecord>, WireError> {
        timeout(self.request_timeout, async {
            let mut stream = TcpStream::connect(endpoint).await?;
            write_frame(&mut stream, &WireRequest::ListFiles {}).await?;

            match read_frame::<_, WireResponse>(&mut stream).await? {
                Some(WireResponse::FileList { files }) => Ok(files),
                Some(WireResponse::Error { code, message }) => {
                    Err(WireError::Remote { code, message })
                }
                Some(other) => Err(WireError::UnexpectedResponse(format!("{other:?}"))),
                None => Err(WireError::ShortRead {
                    expected: 0,
                    got: 0,
                }),
            }
        })
        .await
        .map_err(|_| WireError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Serves one scripted GET_CHUNK response, optionally corrupting or
    /// truncating the payload.
    async fn scripted_chunk_server(
        payload: Vec<u8>,
        announce: u64,
        send: usize,
    ) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _req: Option<WireRequest> = read_frame(&mut stream).await.unwrap();
            write_frame(&mut stream, &WireResponse::ChunkStart { size: announce })
                .await
                .unwrap();
            stream.write_all(&payload[..send]).await.unwrap();
            stream.flush().await.unwrap();
            // Leave closing to the end of scope.
        });
        addr
    }

    #[tokio::test]
    async fn test_digest_mismatch_rejected() {
        let mut bytes = vec![5u8; 128];
        let digest = Digest::of(&bytes);
        // Flip one bit in the served payload.
        bytes[0] ^= 0x01;
        let addr = scripted_chunk_server(bytes, 128, 128).await;

        let client = WireClient::default();
        let err = client
            .fetch_chunk(&addr.to_string(), &digest)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_short_read_detected() {
        let bytes = vec![9u8; 64];
        let digest = Digest::of(&bytes);
        let addr = scripted_chunk_server(bytes, 64, 30).await;

        let client = WireClient::default();
        let err = client
            .fetch_chunk(&addr.to_string(), &digest)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WireError::ShortRead {
                expected: 64,
                got: 30
            }
        ));
    }

    #[tokio::test]
    async fn test_oversized_announcement_is_overflow() {
        let bytes = vec![1u8; 8];
        let digest = Digest::of(&bytes);
        let addr = scripted_chunk_server(bytes, u64::MAX, 8).await;

        let client = WireClient::default();
        let err = client
            .fetch_chunk(&addr.to_string(), &digest)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Overflow { .. }));
    }

    #[tokio::test]
    async fn test_unresponsive_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            // Hold the connection open without answering.
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = WireClient::new(Duration::from_millis(100), DEFAULT_MAX_CHUNK_PAYLOAD);
        let err = client
            .fetch_chunk(&addr.to_string(), &Digest::of(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Timeout));
    }
}
