//! The DHT node: UDP endpoint, RPC handlers and iterative operations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pando_core::{Key, NodeId, PeerHandle};
use pando_proto::dht::{fragment_nodes, Datagram, DatagramBody, TxnId};

use crate::lookup::Shortlist;
use crate::routing::{InsertOutcome, RoutingTable};
use crate::store::{DhtStore, DhtStoreConfig};
use crate::{
    DhtError, DEFAULT_ALPHA, DEFAULT_K, DEFAULT_LOOKUP_TIMEOUT_SECS, DEFAULT_REFRESH_INTERVAL_SECS,
    DEFAULT_RPC_TIMEOUT_SECS, DEFAULT_TTL_SECS,
};

/// DHT node configuration.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// This node's overlay identity.
    pub local_id: NodeId,
    /// UDP address to bind; port 0 picks an ephemeral one.
    pub bind_addr: SocketAddr,
    /// Address other peers should dial back.
    pub advertised_address: String,
    /// Replication factor and bucket size.
    pub k: usize,
    /// Lookup parallelism.
    pub alpha: usize,
    /// Single RPC deadline.
    pub rpc_timeout: Duration,
    /// End-to-end iterative lookup deadline.
    pub lookup_timeout: Duration,
    /// Value TTL; publications re-announce at half this.
    pub ttl: Duration,
    /// Bucket refresh cadence.
    pub refresh_interval: Duration,
    /// Expiry sweep cadence.
    pub sweep_interval: Duration,
    /// Value store tuning.
    pub store: DhtStoreConfig,
}

impl DhtConfig {
    /// Creates a configuration with conventional defaults.
    pub fn new(local_id: NodeId, bind_addr: SocketAddr) -> Self {
        Self {
            local_id,
            bind_addr,
            advertised_address: "127.0.0.1".to_string(),
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
            lookup_timeout: Duration::from_secs(DEFAULT_LOOKUP_TIMEOUT_SECS),
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            sweep_interval: Duration::from_secs(30),
            store: DhtStoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct Publication {
    value: serde_json::Value,
    ttl: Duration,
}

/// Reply to a `FIND_VALUE` RPC.
#[derive(Debug)]
pub enum FindValueReply {
    /// The responder held the value.
    Value(serde_json::Value),
    /// The responder offered closer peers instead.
    Nodes(Vec<PeerHandle>),
}

/// A running DHT node.
pub struct DhtNode {
    config: DhtConfig,
    socket: UdpSocket,
    local_handle: PeerHandle,
    routing: RoutingTable,
    store: DhtStore,
    pending: Mutex<HashMap<TxnId, oneshot::Sender<Datagram>>>,
    publications: Mutex<HashMap<String, Publication>>,
    shutdown: CancellationToken,
    // Handle to the owning Arc, for spawning tasks from &self methods.
    weak_self: Weak<DhtNode>,
}

impl DhtNode {
    /// Binds the UDP endpoint. Call [`DhtNode::start`] to begin serving.
    pub async fn bind(config: DhtConfig) -> Result<Arc<Self>, DhtError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let port = socket.local_addr()?.port();
        let local_handle =
            PeerHandle::new(config.local_id, config.advertised_address.clone(), port);
        info!(node_id = %config.local_id, port, "dht node bound");

        Ok(Arc::new_cyclic(|weak_self| Self {
            routing: RoutingTable::with_bucket_size(config.local_id, config.k),
            store: DhtStore::new(config.store.clone()),
            pending: Mutex::new(HashMap::new()),
            publications: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            weak_self: weak_self.clone(),
            local_handle,
            socket,
            config,
        }))
    }

    /// The owning `Arc`, for handing clones to spawned tasks. `None` only
    /// while the node is being torn down.
    fn strong(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    /// Returns this node's handle (DHT endpoint).
    pub fn local_handle(&self) -> &PeerHandle {
        &self.local_handle
    }

    /// Returns this node's id.
    pub fn local_id(&self) -> &NodeId {
        &self.config.local_id
    }

    /// Returns the routing table.
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Returns the local value store.
    pub fn store(&self) -> &DhtStore {
        &self.store
    }

    /// Spawns the receive loop and the maintenance tasks.
    pub fn start(&self) {
        let Some(this) = self.strong() else { return };

        let node = this.clone();
        tokio::spawn(async move { node.recv_loop().await });

        let node = this.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    _ = ticker.tick() => { node.store.sweep(); }
                }
            }
        });

        let node = this.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.ttl / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so fresh
            // publications are not re-announced at once.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    _ = ticker.tick() => node.republish_all().await,
                }
            }
        });

        let node = this.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    _ = ticker.tick() => node.refresh_buckets().await,
                }
            }
        });
    }

    /// Stops the receive loop and every maintenance task.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Joins the network through the given `host:port` DHT endpoints:
    /// learns their identities, looks up the local id, then refreshes all
    /// non-empty buckets. Returns how many bootstrap peers answered.
    pub async fn bootstrap(&self, endpoints: &[String]) -> usize {
        let mut reached = 0;
        for endpoint in endpoints {
            let ping = DatagramBody::Ping {
                sender: self.local_handle.clone(),
            };
            match self.request(endpoint, ping).await {
                Ok(reply) if matches!(reply.body, DatagramBody::Pong { .. }) => {
                    debug!(endpoint, "bootstrap peer answered");
                    reached += 1;
                }
                Ok(_) => warn!(endpoint, "bootstrap peer sent unexpected reply"),
                Err(e) => warn!(endpoint, error = %e, "bootstrap peer unreachable"),
            }
        }

        if reached > 0 {
            self.lookup_nodes(self.config.local_id).await;
        }
        self.refresh_buckets().await;
        info!(reached, table = self.routing.len(), "bootstrap complete");
        reached
    }

    /// Stores `value` under `key` at the K closest live peers and locally,
    /// recording the publication for periodic re-announcement. Returns the
    /// number of remote peers that acknowledged.
    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> usize {
        self.store.insert(key, value.clone(), ttl);
        self.publications.lock().insert(
            key.to_string(),
            Publication {
                value: value.clone(),
                ttl,
            },
        );

        let target = Key::for_text(key).as_node_id();
        let closest = self.lookup_nodes(target).await;

        let Some(this) = self.strong() else { return 0 };
        let mut tasks = JoinSet::new();
        for peer in closest.into_iter().take(self.config.k) {
            let node = this.clone();
            let key = key.to_string();
            let value = value.clone();
            tasks.spawn(async move { node.store_rpc(&peer, &key, value, ttl).await });
        }

        let mut acked = 0;
        while let Some(result) = tasks.join_next().await {
            if matches!(result, Ok(Ok(()))) {
                acked += 1;
            }
        }
        debug!(key, acked, "published value");
        acked
    }

    /// Looks a value up, locally first, then iteratively through the
    /// overlay. Returns `None` if no reachable peer holds it.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        if let Some(value) = self.store.get(key) {
            return Some(value);
        }
        self.lookup_value(key).await
    }

    /// Iterative `find_node`: the K closest reachable peers to `target`.
    pub async fn lookup_nodes(&self, target: NodeId) -> Vec<PeerHandle> {
        let initial = self.routing.closest(&target, self.config.k);
        let mut shortlist = Shortlist::new(target, initial, self.config.k, self.config.alpha);
        let deadline = tokio::time::Instant::now() + self.config.lookup_timeout;

        loop {
            if shortlist.is_complete() || tokio::time::Instant::now() >= deadline {
                break;
            }
            let batch = shortlist.next_batch();
            if batch.is_empty() {
                break;
            }
            let before = shortlist.best_distance();

            let Some(this) = self.strong() else { break };
            let mut tasks = JoinSet::new();
            for peer in batch {
                let node = this.clone();
                tasks.spawn(async move { node.find_node_rpc(&peer, target).await });
            }
            while let Some(result) = tasks.join_next().await {
                if let Ok(Ok(nodes)) = result {
                    self.merge_discovered(&mut shortlist, nodes);
                }
            }

            if !improved(before, shortlist.best_distance()) {
                break;
            }
        }
        shortlist.into_result()
    }

    /// Iterative `find_value`: returns on the first `VALUE` response,
    /// republishing the value to the closest peer observed lacking it.
    pub async fn lookup_value(&self, key: &str) -> Option<serde_json::Value> {
        let target = Key::for_text(key).as_node_id();
        let initial = self.routing.closest(&target, self.config.k);
        let mut shortlist = Shortlist::new(target, initial, self.config.k, self.config.alpha);
        let mut lacking: Vec<PeerHandle> = Vec::new();
        let deadline = tokio::time::Instant::now() + self.config.lookup_timeout;

        loop {
            if shortlist.is_complete() || tokio::time::Instant::now() >= deadline {
                break;
            }
            let batch = shortlist.next_batch();
            if batch.is_empty() {
                break;
            }
            let before = shortlist.best_distance();

            let Some(this) = self.strong() else { break };
            let mut tasks = JoinSet::new();
            for peer in batch {
                let node = this.clone();
                let key = key.to_string();
                tasks.spawn(async move {
                    let reply = node.find_value_rpc(&peer, &key).await;
                    (peer, reply)
                });
            }

            let mut found = None;
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok((_, Ok(FindValueReply::Value(value)))) => {
                        found = Some(value);
                        tasks.abort_all();
                        break;
                    }
                    Ok((peer, Ok(FindValueReply::Nodes(nodes)))) => {
                        lacking.push(peer);
                        self.merge_discovered(&mut shortlist, nodes);
                    }
                    _ => {}
                }
            }

            if let Some(value) = found {
                // Cache the hit and backfill the closest peer that missed.
                self.store.insert(key, value.clone(), self.config.ttl);
                if let Some(peer) = lacking
                    .into_iter()
                    .min_by_key(|p| target.distance(&p.node_id.0))
                {
                    if let Some(node) = self.strong() {
                        let key = key.to_string();
                        let republished = value.clone();
                        let ttl = self.config.ttl;
                        tokio::spawn(async move {
                            let _ = node.store_rpc(&peer, &key, republished, ttl).await;
                        });
                    }
                }
                return Some(value);
            }

            if !improved(before, shortlist.best_distance()) {
                break;
            }
        }
        None
    }

    /// Sends `PING` and waits for `PONG`.
    pub async fn ping(&self, peer: &PeerHandle) -> Result<(), DhtError> {
        let body = DatagramBody::Ping {
            sender: self.local_handle.clone(),
        };
        match self.request_peer(peer, body).await?.body {
            DatagramBody::Pong { .. } => Ok(()),
            other => Err(DhtError::UnexpectedResponse(kind_of(&other))),
        }
    }

    async fn find_node_rpc(
        &self,
        peer: &PeerHandle,
        target: NodeId,
    ) -> Result<Vec<PeerHandle>, DhtError> {
        let body = DatagramBody::FindNode {
            sender: self.local_handle.clone(),
            target,
        };
        match self.request_peer(peer, body).await?.body {
            DatagramBody::Nodes { nodes, .. } => Ok(nodes),
            other => Err(DhtError::UnexpectedResponse(kind_of(&other))),
        }
    }

    async fn find_value_rpc(&self, peer: &PeerHandle, key: &str) -> Result<FindValueReply, DhtError> {
        let body = DatagramBody::FindValue {
            sender: self.local_handle.clone(),
            key: key.to_string(),
        };
        match self.request_peer(peer, body).await?.body {
            DatagramBody::Value { value, .. } => Ok(FindValueReply::Value(value)),
            DatagramBody::Nodes { nodes, .. } => Ok(FindValueReply::Nodes(nodes)),
            other => Err(DhtError::UnexpectedResponse(kind_of(&other))),
        }
    }

    async fn store_rpc(
        &self,
        peer: &PeerHandle,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), DhtError> {
        let body = DatagramBody::Store {
            sender: self.local_handle.clone(),
            key: key.to_string(),
            value,
            ttl_secs: ttl.as_secs(),
        };
        match self.request_peer(peer, body).await?.body {
            DatagramBody::Ack { .. } => Ok(()),
            other => Err(DhtError::UnexpectedResponse(kind_of(&other))),
        }
    }

    /// Issues a request to a known peer, penalising it on failure.
    async fn request_peer(
        &self,
        peer: &PeerHandle,
        body: DatagramBody,
    ) -> Result<Datagram, DhtError> {
        match self.request(&peer.endpoint(), body).await {
            Ok(reply) => {
                self.routing.touch(&peer.node_id);
                Ok(reply)
            }
            Err(e) => {
                if self.routing.record_failure(&peer.node_id) {
                    debug!(peer = %peer.node_id, "evicted peer after repeated failures");
                }
                Err(e)
            }
        }
    }

    /// Issues a request to a raw endpoint and awaits the matching response.
    async fn request(&self, endpoint: &str, body: DatagramBody) -> Result<Datagram, DhtError> {
        let txn: TxnId = rand::random();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(txn, tx);

        let datagram = Datagram::new(txn, body);
        let bytes = datagram.to_bytes()?;
        if let Err(e) = self.socket.send_to(&bytes, endpoint).await {
            self.pending.lock().remove(&txn);
            return Err(e.into());
        }

        match timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DhtError::Shutdown),
            Err(_) => {
                self.pending.lock().remove(&txn);
                Err(DhtError::Timeout)
            }
        }
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65_536];
        loop {
            let (len, addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "udp receive failed");
                        continue;
                    }
                },
            };

            match Datagram::from_slice(&buf[..len]) {
                Ok(datagram) => self.handle_datagram(datagram, addr).await,
                Err(e) => debug!(from = %addr, error = %e, "dropping malformed datagram"),
            }
        }
        debug!("dht receive loop stopped");
    }

    async fn handle_datagram(&self, datagram: Datagram, from: SocketAddr) {
        // Every observed RPC refreshes the sender's routing table slot.
        self.observe(datagram.sender().clone());

        if datagram.is_response() {
            // Duplicate responses find no pending entry and are ignored.
            if let Some(tx) = self.pending.lock().remove(&datagram.txn) {
                let _ = tx.send(datagram);
            }
            return;
        }

        let txn = datagram.txn;
        match datagram.body {
            DatagramBody::Ping { .. } => {
                self.reply(
                    from,
                    Datagram::new(
                        txn,
                        DatagramBody::Pong {
                            sender: self.local_handle.clone(),
                        },
                    ),
                )
                .await;
            }

            DatagramBody::FindNode { sender, target } => {
                let nodes = self.closest_excluding(&target, &sender.node_id);
                self.reply_nodes(from, txn, nodes).await;
            }

            DatagramBody::FindValue { sender, key } => match self.store.get(&key) {
                Some(value) => {
                    self.reply(
                        from,
                        Datagram::new(
                            txn,
                            DatagramBody::Value {
                                sender: self.local_handle.clone(),
                                key,
                                value,
                            },
                        ),
                    )
                    .await;
                }
                None => {
                    let target = Key::for_text(&key).as_node_id();
                    let nodes = self.closest_excluding(&target, &sender.node_id);
                    self.reply_nodes(from, txn, nodes).await;
                }
            },

            DatagramBody::Store {
                key, value, ttl_secs, ..
            } => {
                self.store
                    .insert(&key, value, Duration::from_secs(ttl_secs));
                self.reply(
                    from,
                    Datagram::new(
                        txn,
                        DatagramBody::Ack {
                            sender: self.local_handle.clone(),
                        },
                    ),
                )
                .await;
            }

            // Responses were handled above.
            _ => {}
        }
    }

    fn closest_excluding(&self, target: &NodeId, requester: &NodeId) -> Vec<PeerHandle> {
        self.routing
            .closest(target, self.config.k + 1)
            .into_iter()
            .filter(|p| p.node_id != *requester)
            .take(self.config.k)
            .collect()
    }

    /// Sends a `NODES` reply, fragmenting the list across datagrams when
    /// it would not fit one UDP payload.
    async fn reply_nodes(&self, to: SocketAddr, txn: TxnId, nodes: Vec<PeerHandle>) {
        for fragment in fragment_nodes(&nodes) {
            self.reply(
                to,
                Datagram::new(
                    txn,
                    DatagramBody::Nodes {
                        sender: self.local_handle.clone(),
                        nodes: fragment,
                    },
                ),
            )
            .await;
        }
    }

    async fn reply(&self, to: SocketAddr, datagram: Datagram) {
        match datagram.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, to).await {
                    debug!(to = %to, error = %e, "failed to send reply");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode reply"),
        }
    }

    /// Tracks a peer observed in any RPC, probing the stalest occupant of
    /// a full bucket before letting the newcomer displace it.
    fn observe(&self, handle: PeerHandle) {
        if handle.node_id == self.config.local_id {
            return;
        }
        if let InsertOutcome::Full { least_recent } = self.routing.observe(handle.clone()) {
            let Some(node) = self.strong() else { return };
            tokio::spawn(async move {
                if node.ping(&least_recent).await.is_err() {
                    debug!(stale = %least_recent.node_id, "evicting unresponsive peer");
                    node.routing.replace(&least_recent.node_id, handle);
                }
            });
        }
    }

    fn merge_discovered(&self, shortlist: &mut Shortlist, nodes: Vec<PeerHandle>) {
        let local = self.config.local_id;
        let filtered: Vec<PeerHandle> = nodes
            .into_iter()
            .filter(|p| p.node_id != local)
            .collect();
        for peer in &filtered {
            self.observe(peer.clone());
        }
        shortlist.merge(filtered);
    }

    async fn republish_all(&self) {
        let snapshot: Vec<(String, Publication)> = self
            .publications
            .lock()
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect();
        debug!(keys = snapshot.len(), "republishing");
        for (key, publication) in snapshot {
            self.set(&key, publication.value, publication.ttl).await;
        }
    }

    async fn refresh_buckets(&self) {
        for index in self.routing.non_empty_buckets() {
            let target = self.routing.random_id_in_bucket(index);
            self.lookup_nodes(target).await;
        }
    }
}

fn improved(before: Option<[u8; 20]>, after: Option<[u8; 20]>) -> bool {
    match (before, after) {
        (Some(b), Some(a)) => a < b,
        (None, Some(_)) => true,
        _ => false,
    }
}

fn kind_of(body: &DatagramBody) -> String {
    match body {
        DatagramBody::Ping { .. } => "PING",
        DatagramBody::Pong { .. } => "PONG",
        DatagramBody::FindNode { .. } => "FIND_NODE",
        DatagramBody::Nodes { .. } => "NODES",
        DatagramBody::FindValue { .. } => "FIND_VALUE",
        DatagramBody::Value { .. } => "VALUE",
        DatagramBody::Store { .. } => "STORE",
        DatagramBody::Ack { .. } => "ACK",
    }
    .to_string()
}
