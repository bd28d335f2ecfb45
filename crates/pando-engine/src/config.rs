//! Engine configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use pando_core::DEFAULT_CHUNK_SIZE;

/// Default bound on concurrent chunk fetches within one file download.
pub const DEFAULT_MAX_INFLIGHT: usize = 5;

/// Default grace period for draining serve tasks at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Cap applied to the announcement retry backoff.
pub const MAX_ANNOUNCE_BACKOFF: Duration = Duration::from_secs(60);

/// Everything a node needs to run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// File persisting the node's random identity across restarts.
    pub node_id_file: PathBuf,
    /// Directory for the chunk store and index.
    pub storage_dir: PathBuf,
    /// Chunking unit in bytes.
    pub chunk_size: u32,
    /// UDP port for the DHT; 0 picks an ephemeral one.
    pub dht_port: u16,
    /// TCP port for serving chunks; 0 picks an ephemeral one.
    pub serve_port: u16,
    /// Address to bind both transports on.
    pub bind_address: String,
    /// Address advertised to peers for dialing back.
    pub advertised_address: String,
    /// DHT endpoints (`host:port`) to join through.
    pub bootstrap_peers: Vec<String>,
    /// DHT replication factor (K).
    pub replication_factor: usize,
    /// DHT value TTL.
    pub ttl: Duration,
    /// Per-request wire deadline.
    pub request_timeout: Duration,
    /// Single DHT RPC deadline.
    pub rpc_timeout: Duration,
    /// End-to-end iterative lookup deadline.
    pub lookup_timeout: Duration,
    /// Bound on concurrent chunk fetches per file download.
    pub max_inflight: usize,
    /// Bound on concurrently served wire connections.
    pub max_serve_concurrency: usize,
    /// Grace period for serve tasks at shutdown.
    pub shutdown_grace: Duration,
}

impl EngineConfig {
    /// A configuration rooted at `data_dir` with default tunables and
    /// ephemeral ports.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            node_id_file: data_dir.join("node_id"),
            storage_dir: data_dir.join("storage"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            dht_port: 0,
            serve_port: 0,
            bind_address: "127.0.0.1".to_string(),
            advertised_address: "127.0.0.1".to_string(),
            bootstrap_peers: Vec::new(),
            replication_factor: pando_dht::DEFAULT_K,
            ttl: Duration::from_secs(pando_dht::DEFAULT_TTL_SECS),
            request_timeout: pando_wire::DEFAULT_REQUEST_TIMEOUT,
            rpc_timeout: Duration::from_secs(pando_dht::DEFAULT_RPC_TIMEOUT_SECS),
            lookup_timeout: Duration::from_secs(pando_dht::DEFAULT_LOOKUP_TIMEOUT_SECS),
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_serve_concurrency: pando_wire::DEFAULT_MAX_SERVE_CONCURRENCY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// The DHT bind address.
    pub fn dht_addr(&self) -> Result<SocketAddr, crate::EngineError> {
        format!("{}:{}", self.bind_address, self.dht_port)
            .parse()
            .map_err(|e| crate::EngineError::Config(format!("invalid dht address: {e}")))
    }

    /// The wire server bind address.
    pub fn serve_addr(&self) -> Result<SocketAddr, crate::EngineError> {
        format!("{}:{}", self.bind_address, self.serve_port)
            .parse()
            .map_err(|e| crate::EngineError::Config(format!("invalid serve address: {e}")))
    }

    /// Validates the parts that would otherwise fail deep inside startup.
    pub fn validate(&self) -> Result<(), crate::EngineError> {
        if self.chunk_size == 0 {
            return Err(crate::EngineError::Config("chunk_size must be > 0".into()));
        }
        if self.replication_factor == 0 {
            return Err(crate::EngineError::Config(
                "replication_factor must be > 0".into(),
            ));
        }
        if self.max_inflight == 0 || self.max_serve_concurrency == 0 {
            return Err(crate::EngineError::Config(
                "concurrency bounds must be > 0".into(),
            ));
        }
        self.dht_addr()?;
        self.serve_addr()?;
        Ok(())
    }
}
