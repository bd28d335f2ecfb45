//! The peer engine.
//!
//! Owns the composed leaves and implements advertisement and publish; the
//! download path lives in [`crate::fetch`].

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pando_core::{Digest, PeerHandle};
use pando_dht::DhtNode;
use pando_proto::FileRecord;
use pando_store::ChunkStore;
use pando_wire::{ChunkProvider, WireClient};

use crate::config::{EngineConfig, MAX_ANNOUNCE_BACKOFF};
use crate::EngineError;

/// Textual DHT key for a chunk's holder list.
pub fn chunk_key(digest: &Digest) -> String {
    format!("chunk:{}", digest.to_hex())
}

/// Textual DHT key for a file's metadata record.
pub fn file_key(digest: &Digest) -> String {
    format!("file:{}", digest.to_hex())
}

/// The concurrent peer node: advertises local content into the DHT, serves
/// chunks, and fetches files on demand.
pub struct PeerEngine {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<ChunkStore>,
    pub(crate) dht: Arc<DhtNode>,
    pub(crate) client: WireClient,
    /// The handle peers use to fetch chunks from this node (serve port).
    pub(crate) serve_handle: PeerHandle,
    pub(crate) cancel: CancellationToken,
    // Handle to the owning Arc, for spawning tasks from &self methods.
    weak_self: Weak<PeerEngine>,
}

impl PeerEngine {
    /// Assembles the engine around already started leaves.
    pub fn new(
        config: EngineConfig,
        store: Arc<ChunkStore>,
        dht: Arc<DhtNode>,
        serve_port: u16,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let client = WireClient::new(
            config.request_timeout,
            pando_wire::DEFAULT_MAX_CHUNK_PAYLOAD.max(config.chunk_size as u64),
        );
        let serve_handle = PeerHandle::new(
            *dht.local_id(),
            config.advertised_address.clone(),
            serve_port,
        );
        Arc::new_cyclic(|weak_self| Self {
            config,
            store,
            dht,
            client,
            serve_handle,
            cancel,
            weak_self: weak_self.clone(),
        })
    }

    /// The owning `Arc`, for handing clones to spawned tasks. `None` only
    /// while the engine is being torn down.
    pub(crate) fn strong(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    /// The handle other peers dial to fetch chunks from this node.
    pub fn serve_handle(&self) -> &PeerHandle {
        &self.serve_handle
    }

    /// Returns the local chunk store.
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Returns the overlay node.
    pub fn dht(&self) -> &Arc<DhtNode> {
        &self.dht
    }

    /// Stores a file locally and announces it to the network.
    ///
    /// The publish is complete once the store commit succeeds; DHT
    /// announcements proceed in a background task and are retried with
    /// exponential backoff.
    pub async fn publish(
        &self,
        path: PathBuf,
        k: usize,
        m: usize,
        original_name: Option<String>,
    ) -> Result<Digest, EngineError> {
        let store = self.store.clone();
        let digest =
            tokio::task::spawn_blocking(move || store.store(&path, k, m, original_name)).await??;

        if let Some(record) = self.store.get_record(&digest) {
            if let Some(engine) = self.strong() {
                tokio::spawn(async move { engine.announce_record(&record).await });
            }
        }
        Ok(digest)
    }

    /// Returns every locally stored file record.
    pub async fn list_local(&self) -> Result<Vec<FileRecord>, EngineError> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.list_files()).await?)
    }

    /// Deletes a locally stored file.
    pub async fn delete(&self, digest: Digest) -> Result<(), EngineError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.delete(&digest)).await??;
        Ok(())
    }

    /// Advertises every local chunk and file record into the DHT.
    ///
    /// Runs in the background at startup; lookups already in flight are
    /// unaffected. With `retry` set, failed announcements back off
    /// exponentially (capped) until they succeed or the engine stops.
    pub async fn announce_all(&self, retry: bool) {
        let store = self.store.clone();
        let chunks = match tokio::task::spawn_blocking(move || store.list_local_chunks()).await {
            Ok(Ok(chunks)) => chunks,
            _ => {
                warn!("failed to enumerate local chunks for announcement");
                Vec::new()
            }
        };
        let records = self.store.list_files();
        info!(
            chunks = chunks.len(),
            files = records.len(),
            "announcing local content"
        );

        for digest in chunks {
            self.announce_until_ok(chunk_key(&digest), self.holder_value(), retry)
                .await;
        }
        for record in records {
            self.announce_file_record(&record, retry).await;
        }
    }

    /// Advertises one record and those of its chunks this node holds.
    ///
    /// A fetch that reconstructed a file from data shards alone never
    /// pulled the parity blobs, and a node must not claim chunks it cannot
    /// serve.
    pub async fn announce_record(&self, record: &FileRecord) {
        let store = self.store.clone();
        let digests: Vec<Digest> = record.all_chunks().copied().collect();
        let held = tokio::task::spawn_blocking(move || {
            digests
                .into_iter()
                .filter(|d| store.has_chunk(d))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();

        for digest in held {
            self.announce_until_ok(chunk_key(&digest), self.holder_value(), true)
                .await;
        }
        self.announce_file_record(record, true).await;
    }

    async fn announce_file_record(&self, record: &FileRecord, retry: bool) {
        match serde_json::to_value(record) {
            Ok(value) => {
                self.announce_until_ok(file_key(&record.file_digest), value, retry)
                    .await
            }
            Err(e) => warn!(file = %record.file_digest, error = %e, "failed to encode record"),
        }
    }

    /// One `SET`, retried with exponential backoff while `retry` holds.
    async fn announce_until_ok(&self, key: String, value: serde_json::Value, retry: bool) {
        let mut backoff = Duration::from_secs(1);
        loop {
            let acked = self.dht.set(&key, value.clone(), self.config.ttl).await;
            // In a single-node network local storage is the whole of the
            // replica set; nothing remote can ack.
            if acked > 0 || self.dht.routing().is_empty() {
                debug!(key, acked, "announced");
                return;
            }
            if !retry {
                return;
            }
            warn!(key, retry_in = ?backoff, "announcement unacknowledged, retrying");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_ANNOUNCE_BACKOFF);
        }
    }

    fn holder_value(&self) -> serde_json::Value {
        serde_json::json!([self.serve_handle])
    }

    /// Resolves a file record: local index first, then the overlay.
    pub(crate) async fn lookup_record(&self, digest: &Digest) -> Option<FileRecord> {
        if let Some(record) = self.store.get_record(digest) {
            return Some(record);
        }
        let value = self.dht.get(&file_key(digest)).await?;
        match serde_json::from_value::<FileRecord>(value) {
            Ok(record) if record.is_well_formed() && record.file_digest == *digest => Some(record),
            Ok(_) => {
                warn!(file = %digest, "discarding malformed record from dht");
                None
            }
            Err(e) => {
                warn!(file = %digest, error = %e, "undecodable record from dht");
                None
            }
        }
    }

    /// Resolves the candidate holder list for a chunk.
    pub(crate) async fn lookup_holders(&self, digest: &Digest) -> Vec<PeerHandle> {
        let Some(value) = self.dht.get(&chunk_key(digest)).await else {
            return Vec::new();
        };
        let Some(entries) = value.as_array() else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|e| serde_json::from_value::<PeerHandle>(e.clone()).ok())
            .filter(|p| p.node_id != *self.dht.local_id())
            .collect()
    }
}

/// Read-only capability the wire server uses to serve local content.
pub struct StoreProvider {
    store: Arc<ChunkStore>,
}

impl StoreProvider {
    /// Wraps a store.
    pub fn new(store: Arc<ChunkStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChunkProvider for StoreProvider {
    async fn chunk(&self, digest: &Digest) -> Option<Vec<u8>> {
        let store = self.store.clone();
        let digest = *digest;
        tokio::task::spawn_blocking(move || store.read_chunk(&digest).ok())
            .await
            .ok()
            .flatten()
    }

    async fn file_record(&self, digest: &Digest) -> Option<FileRecord> {
        let store = self.store.clone();
        let digest = *digest;
        tokio::task::spawn_blocking(move || store.get_record(&digest))
            .await
            .ok()
            .flatten()
    }

    async fn file_records(&self) -> Vec<FileRecord> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list_files())
            .await
            .unwrap_or_default()
    }
}
