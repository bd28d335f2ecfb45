//! A single test node: a supervisor over tempdir-backed storage bound to
//! ephemeral localhost ports.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tracing::info;

use pando_core::Digest;
use pando_engine::{EngineConfig, EngineError, NodeSupervisor};
use pando_proto::FileRecord;

/// One node under test.
pub struct TestNode {
    /// The running supervisor.
    pub supervisor: NodeSupervisor,
    temp_dir: TempDir,
}

impl TestNode {
    /// Starts a node with test-sized timeouts, optionally bootstrapping
    /// through the given DHT endpoints.
    pub async fn start(bootstrap: Vec<String>) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let mut config = EngineConfig::new(temp_dir.path());
        config.bootstrap_peers = bootstrap;
        config.rpc_timeout = Duration::from_millis(800);
        config.lookup_timeout = Duration::from_secs(3);
        config.request_timeout = Duration::from_secs(5);
        config.shutdown_grace = Duration::from_secs(1);

        let supervisor = NodeSupervisor::start(config).await.map_err(anyhow::Error::from)?;
        info!(
            dht = supervisor.dht_endpoint(),
            serve = %supervisor.serve_addr(),
            "test node started"
        );
        Ok(Self {
            supervisor,
            temp_dir,
        })
    }

    /// The node's DHT endpoint, for bootstrapping others.
    pub fn dht_endpoint(&self) -> String {
        self.supervisor.dht_endpoint()
    }

    /// Writes `bytes` to a fresh file inside the node's tempdir.
    pub fn write_file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, bytes).expect("write test input");
        path
    }

    /// A path inside the node's tempdir for fetched output.
    pub fn out_path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// The storage directory holding chunk blobs and the index.
    pub fn storage_dir(&self) -> PathBuf {
        self.temp_dir.path().join("storage")
    }

    /// Publishes a file and returns its digest.
    pub async fn publish(&self, path: &Path, k: usize, m: usize) -> Result<Digest, EngineError> {
        self.supervisor
            .publish(path, k, m, path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .await
    }

    /// Fetches a file to `out`.
    pub async fn fetch(&self, digest: Digest, out: &Path) -> Result<(), EngineError> {
        self.supervisor.fetch_file(digest, out).await
    }

    /// Locally held file records.
    pub async fn records(&self) -> Vec<FileRecord> {
        self.supervisor.list_local().await.unwrap_or_default()
    }

    /// Returns true once this node's own DHT store holds the file key,
    /// i.e. the background announcement has landed.
    pub fn has_announced(&self, digest: &Digest) -> bool {
        self.supervisor
            .engine()
            .dht()
            .store()
            .contains(&pando_engine::engine::file_key(digest))
    }

    /// Returns true if the node holds every data chunk of `record`
    /// locally. Parity chunks are only pulled when a stripe cannot be
    /// completed from data, so a clean fetch leaves them remote.
    pub fn holds_all_data_chunks(&self, record: &FileRecord) -> bool {
        record
            .data_chunks
            .iter()
            .all(|d| self.supervisor.engine().store().has_chunk(d))
    }

    /// Deletes a chunk blob out from under the node, simulating loss.
    pub fn corrupt_lose_chunk(&self, digest: &Digest) {
        let path = self.storage_dir().join(digest.to_hex());
        std::fs::remove_file(path).expect("remove chunk blob");
    }

    /// Graceful shutdown.
    pub async fn shutdown(self) {
        self.supervisor.shutdown().await;
    }
}
