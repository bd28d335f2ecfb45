//! Node lifecycle.
//!
//! Starts the leaves in dependency order, owns the top-level cancellation
//! signal, and exposes the public operations. Shutdown drains the wire
//! accept loop, waits out in-flight serve tasks up to a grace period, makes
//! one final announcement pass, then stops the DHT; the store index closes
//! when the supervisor drops.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pando_core::{Digest, NodeId};
use pando_dht::{DhtConfig, DhtNode};
use pando_proto::FileRecord;
use pando_store::{ChunkStore, StoreConfig};
use pando_wire::{WireConfig, WireServer};

use crate::engine::{PeerEngine, StoreProvider};
use crate::{EngineConfig, EngineError};

/// A running node.
pub struct NodeSupervisor {
    engine: Arc<PeerEngine>,
    cancel: CancellationToken,
    serve_cancel: CancellationToken,
    server_task: JoinHandle<()>,
    serve_addr: SocketAddr,
    shutdown_grace: std::time::Duration,
}

impl NodeSupervisor {
    /// Starts a node: identity, store, DHT (with bootstrap), then the wire
    /// server and the background advertisement pass.
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let cancel = CancellationToken::new();

        // 1. Identity.
        let node_id = load_or_create_node_id(&config.node_id_file)?;
        info!(node_id = %node_id, "starting node");

        // 2. Chunk store and file index.
        let store_config =
            StoreConfig::new(config.storage_dir.clone()).with_chunk_size(config.chunk_size);
        let store =
            Arc::new(tokio::task::spawn_blocking(move || ChunkStore::open(store_config)).await??);

        // 3. DHT: bind, start, bootstrap.
        let mut dht_config = DhtConfig::new(node_id, config.dht_addr()?);
        dht_config.advertised_address = config.advertised_address.clone();
        dht_config.k = config.replication_factor;
        dht_config.ttl = config.ttl;
        dht_config.rpc_timeout = config.rpc_timeout;
        dht_config.lookup_timeout = config.lookup_timeout;
        let dht = DhtNode::bind(dht_config).await?;
        dht.start();
        if !config.bootstrap_peers.is_empty() {
            dht.bootstrap(&config.bootstrap_peers).await;
        }

        // 4. Wire server, bound before the engine so the advertised serve
        //    port is the real one.
        let wire_config = WireConfig {
            max_serve_concurrency: config.max_serve_concurrency,
            request_timeout: config.request_timeout,
            ..Default::default()
        };
        let provider = Arc::new(StoreProvider::new(store.clone()));
        let server = WireServer::bind(config.serve_addr()?, provider, wire_config).await?;
        let serve_addr = server.local_addr()?;

        let shutdown_grace = config.shutdown_grace;
        let engine = PeerEngine::new(config, store, dht, serve_addr.port(), cancel.child_token());

        // 5. Advertise local content in the background; lookups already in
        //    flight are unaffected.
        let announcer = engine.clone();
        tokio::spawn(async move { announcer.announce_all(true).await });

        // 6. Serve.
        let serve_cancel = cancel.child_token();
        let server_task = tokio::spawn(server.run(serve_cancel.clone(), shutdown_grace));

        info!(serve = %serve_addr, dht = %engine.dht().local_handle(), "node started");
        Ok(Self {
            engine,
            cancel,
            serve_cancel,
            server_task,
            serve_addr,
            shutdown_grace,
        })
    }

    /// The engine, for composition and tests.
    pub fn engine(&self) -> &Arc<PeerEngine> {
        &self.engine
    }

    /// Address of the chunk-serving transport.
    pub fn serve_addr(&self) -> SocketAddr {
        self.serve_addr
    }

    /// This node's DHT endpoint, for bootstrapping other nodes.
    pub fn dht_endpoint(&self) -> String {
        self.engine.dht().local_handle().endpoint()
    }

    /// Stores a file and announces it. Returns the file digest.
    pub async fn publish(
        &self,
        path: impl Into<PathBuf>,
        k: usize,
        m: usize,
        original_name: Option<String>,
    ) -> Result<Digest, EngineError> {
        self.engine.publish(path.into(), k, m, original_name).await
    }

    /// Locates and downloads a file into `out_path`.
    pub async fn fetch_file(
        &self,
        file_digest: Digest,
        out_path: impl Into<PathBuf>,
    ) -> Result<(), EngineError> {
        self.engine.fetch_file(file_digest, out_path.into()).await
    }

    /// Lists locally stored files.
    pub async fn list_local(&self) -> Result<Vec<FileRecord>, EngineError> {
        self.engine.list_local().await
    }

    /// Deletes a locally stored file.
    pub async fn delete(&self, file_digest: Digest) -> Result<(), EngineError> {
        self.engine.delete(file_digest).await
    }

    /// Graceful shutdown.
    pub async fn shutdown(self) {
        info!("shutting down node");

        // Stop accepting; the server drains serve tasks up to the grace
        // period on its own.
        self.serve_cancel.cancel();
        if tokio::time::timeout(self.shutdown_grace * 2, self.server_task)
            .await
            .is_err()
        {
            warn!("wire server did not stop within grace period");
        }

        // One final announcement pass keeps replicas alive through churn.
        self.engine.announce_all(false).await;

        self.engine.dht().stop();
        self.cancel.cancel();
        info!("node stopped");
    }
}

/// Loads the persisted node identity, generating and saving one on first
/// start.
fn load_or_create_node_id(path: &Path) -> Result<NodeId, EngineError> {
    if path.exists() {
        let content = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("unreadable node id file: {e}")))?;
        return NodeId::from_hex(content.trim())
            .map_err(|e| EngineError::Config(format!("invalid node id file: {e}")));
    }

    let node_id = NodeId::random();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::Config(format!("cannot create id directory: {e}")))?;
        }
    }
    fs::write(path, format!("{}\n", node_id.to_hex()))
        .map_err(|e| EngineError::Config(format!("cannot persist node id: {e}")))?;
    info!(node_id = %node_id, "generated new node identity");
    Ok(node_id)
}
