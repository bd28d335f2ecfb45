//! The serving side of the wire protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pando_proto::{WireErrorCode, WireRequest, WireResponse};

use crate::codec::{read_frame, write_frame};
use crate::{ChunkProvider, WireConfig, WireError};

/// Accepts peer connections and serves chunk and metadata requests.
///
/// Requests for objects this node does not hold answer `NOT_FOUND`; the
/// server never fetches on behalf of a peer.
pub struct WireServer {
    listener: TcpListener,
    provider: Arc<dyn ChunkProvider>,
    config: WireConfig,
}

impl WireServer {
    /// Binds the server to `addr`.
    pub async fn bind(
        addr: SocketAddr,
        provider: Arc<dyn ChunkProvider>,
        config: WireConfig,
    ) -> Result<Self, WireError> {
        let listener = TcpListener::bind(addr).await?;
        debug!(addr = %listener.local_addr()?, "wire server bound");
        Ok(Self {
            listener,
            provider,
            config,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, WireError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop until `shutdown` fires, then drains in-flight
    /// serve tasks for up to `grace`.
    pub async fn run(self, shutdown: CancellationToken, grace: Duration) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_serve_concurrency));
        let mut tasks = JoinSet::new();

        loop {
            // The cap applies to accepts: with every permit out, new
            // connections wait in the backlog rather than queueing here.
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };

            debug!(peer = %peer, "accepted connection");
            let provider = self.provider.clone();
            tasks.spawn(async move {
                if let Err(e) = serve_connection(stream, provider).await {
                    debug!(peer = %peer, error = %e, "connection ended with error");
                }
                drop(permit);
            });

            // Reap finished tasks without blocking the accept loop.
            while tasks.try_join_next().is_some() {}
        }

        drop(self.listener);
        if tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("serve tasks still running at end of grace period, aborting");
            tasks.abort_all();
        }
    }
}

/// Serves requests on one connection until the peer closes it.
async fn serve_connection(
    mut stream: TcpStream,
    provider: Arc<dyn ChunkProvider>,
) -> Result<(), WireError> {
    loop {
        let request: Option<WireRequest> = match read_frame(&mut stream).await {
            Ok(req) => req,
            Err(WireError::Frame(e)) => {
                // Unparseable input: report and drop the connection.
                let reply = WireResponse::Error {
                    code: WireErrorCode::BadRequest,
                    message: e.to_string(),
                };
                let _ = write_frame(&mut stream, &reply).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let Some(request) = request else {
            return Ok(());
        };

        match request {
            WireRequest::GetChunk { chunk_hash } => {
                match provider.chunk(&chunk_hash).await {
                    Some(bytes) => {
                        debug!(digest = %chunk_hash, size = bytes.len(), "serving chunk");
                        let header = WireResponse::ChunkStart {
                            size: bytes.len() as u64,
                        };
                        write_frame(&mut stream, &header).await?;
                        stream.write_all(&bytes).await?;
                        stream.flush().await?;
                    }
                    None => {
                        write_frame(
                            &mut stream,
                            &WireResponse::Error {
                                code: WireErrorCode::NotFound,
                                message: format!("chunk {chunk_hash} not held"),
                            },
                        )
                        .await?;
                    }
                }
            }

            WireRequest::GetFileMetadata { file_hash } => {
                match provider.file_record(&file_hash).await {
                    Some(record) => {
                        write_frame(&mut stream, &WireResponse::FileMetadata { record }).await?;
                    }
                    None => {
                        write_frame(
                            &mut stream,
                            &WireResponse::Error {
                                code: WireErrorCode::NotFound,
                                message: format!("file {file_hash} not held"),
                            },
                        )
                        .await?;
                    }
                }
            }

            WireRequest::ListFiles {} => {
                let files = provider.file_records().await;
                write_frame(&mut stream, &WireResponse::FileList { files }).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireClient;
    use async_trait::async_trait;
    use pando_core::{Digest, Timestamp};
    use pando_proto::FileRecord;
    use std::collections::HashMap;

    struct MapProvider {
        chunks: HashMap<Digest, Vec<u8>>,
        records: HashMap<Digest, FileRecord>,
    }

    #[async_trait]
    impl ChunkProvider for MapProvider {
        async fn chunk(&self, digest: &Digest) -> Option<Vec<u8>> {
            self.chunks.get(digest).cloned()
        }

        async fn file_record(&self, digest: &Digest) -> Option<FileRecord> {
            self.records.get(digest).cloned()
        }

        async fn file_records(&self) -> Vec<FileRecord> {
            self.records.values().cloned().collect()
        }
    }

    fn record_of(chunks: &[(Digest, Vec<u8>)]) -> FileRecord {
        let now = Timestamp::now();
        let size: u64 = chunks.iter().map(|(_, b)| b.len() as u64).sum();
        FileRecord {
            file_digest: Digest::of(b"whole file"),
            original_name: Some("served.bin".to_string()),
            size,
            k: chunks.len().max(1),
            m: 0,
            chunk_size: 64,
            data_chunks: chunks.iter().map(|(d, _)| *d).collect(),
            parity_chunks: vec![],
            created_at: now,
            accessed_at: now,
        }
    }

    async fn start_server(provider: MapProvider) -> (SocketAddr, CancellationToken) {
        let server = WireServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(provider),
            WireConfig::default(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        let run_token = token.clone();
        tokio::spawn(server.run(run_token, Duration::from_secs(1)));
        (addr, token)
    }

    #[tokio::test]
    async fn test_get_chunk_roundtrip() {
        let bytes = vec![7u8; 300];
        let digest = Digest::of(&bytes);
        let provider = MapProvider {
            chunks: HashMap::from([(digest, bytes.clone())]),
            records: HashMap::new(),
        };
        let (addr, token) = start_server(provider).await;

        let client = WireClient::default();
        let got = client.fetch_chunk(&addr.to_string(), &digest).await.unwrap();
        assert_eq!(got, bytes);
        token.cancel();
    }

    #[tokio::test]
    async fn test_missing_chunk_is_not_found() {
        let provider = MapProvider {
            chunks: HashMap::new(),
            records: HashMap::new(),
        };
        let (addr, token) = start_server(provider).await;

        let client = WireClient::default();
        let err = client
            .fetch_chunk(&addr.to_string(), &Digest::of(b"absent"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        token.cancel();
    }

    #[tokio::test]
    async fn test_file_metadata_roundtrip() {
        let bytes = vec![1u8; 64];
        let digest = Digest::of(&bytes);
        let record = record_of(&[(digest, bytes)]);
        let provider = MapProvider {
            chunks: HashMap::new(),
            records: HashMap::from([(record.file_digest, record.clone())]),
        };
        let (addr, token) = start_server(provider).await;

        let client = WireClient::default();
        let got = client
            .fetch_metadata(&addr.to_string(), &record.file_digest)
            .await
            .unwrap();
        assert_eq!(got, record);

        let listed = client.list_files(&addr.to_string()).await.unwrap();
        assert_eq!(listed, vec![record]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_bad_request() {
        let provider = MapProvider {
            chunks: HashMap::new(),
            records: HashMap::new(),
        };
        let (addr, token) = start_server(provider).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let garbage = b"this is not json";
        stream
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(garbage).await.unwrap();

        let reply: WireResponse = read_frame(&mut stream).await.unwrap().unwrap();
        assert!(matches!(
            reply,
            WireResponse::Error {
                code: WireErrorCode::BadRequest,
                ..
            }
        ));
        token.cancel();
    }

    #[tokio::test]
    async fn test_multiple_requests_per_connection() {
        let a = vec![1u8; 10];
        let b = vec![2u8; 20];
        let da = Digest::of(&a);
        let db = Digest::of(&b);
        let provider = MapProvider {
            chunks: HashMap::from([(da, a.clone()), (db, b.clone())]),
            records: HashMap::new(),
        };
        let (addr, token) = start_server(provider).await;

        // One connection, two requests back to back.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        for (digest, expect) in [(da, &a), (db, &b)] {
            write_frame(&mut stream, &WireRequest::GetChunk { chunk_hash: digest })
                .await
                .unwrap();
            let header: WireResponse = read_frame(&mut stream).await.unwrap().unwrap();
            let WireResponse::ChunkStart { size } = header else {
                panic!("expected CHUNK_START");
            };
            let mut payload = vec![0u8; size as usize];
            tokio::io::AsyncReadExt::read_exact(&mut stream, &mut payload)
                .await
                .unwrap();
            assert_eq!(&payload, expect);
        }
        token.cancel();
    }
}
