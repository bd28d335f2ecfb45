//! Network-level helpers: node collections, condition polling, and a
//! deliberately corrupt chunk server.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::info;

use crate::node::TestNode;

/// A collection of nodes joined through the first one.
pub struct TestNetwork {
    nodes: Vec<TestNode>,
}

impl TestNetwork {
    /// Starts `count` nodes; every node after the first bootstraps through
    /// the first node's DHT endpoint.
    pub async fn with_nodes(count: usize) -> Result<Self> {
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            let bootstrap = nodes
                .first()
                .map(|n: &TestNode| vec![n.dht_endpoint()])
                .unwrap_or_default();
            nodes.push(TestNode::start(bootstrap).await?);
        }
        info!(count, "test network up");
        Ok(Self { nodes })
    }

    /// Adds one more node bootstrapped through node 0.
    pub async fn add_node(&mut self) -> Result<&TestNode> {
        let bootstrap = self
            .nodes
            .first()
            .map(|n| vec![n.dht_endpoint()])
            .unwrap_or_default();
        self.nodes.push(TestNode::start(bootstrap).await?);
        Ok(self.nodes.last().expect("just pushed"))
    }

    /// Returns node `index`.
    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Removes and returns node `index`, e.g. to shut it down mid-test.
    pub fn take_node(&mut self, index: usize) -> TestNode {
        self.nodes.remove(index)
    }

    /// Shuts every node down.
    pub async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}

/// Polls `condition` until it holds or `timeout` elapses. Returns whether
/// it ever held.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Starts a server that answers every `GET_CHUNK` with plausible-looking
/// but corrupt bytes. Returns its address for use as a fake holder.
pub async fn corrupt_chunk_server(payload_size: usize) -> Result<SocketAddr> {
    use pando_proto::{WireRequest, WireResponse};

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                // One request per connection is all the client needs.
                let request: Result<Option<WireRequest>, _> =
                    pando_wire::codec::read_frame(&mut stream).await;
                if !matches!(request, Ok(Some(WireRequest::GetChunk { .. }))) {
                    return;
                }
                let header = WireResponse::ChunkStart {
                    size: payload_size as u64,
                };
                if pando_wire::codec::write_frame(&mut stream, &header)
                    .await
                    .is_err()
                {
                    return;
                }
                // The right length, the wrong bytes: digests cannot match.
                let garbage = vec![0xEE; payload_size];
                let _ = stream.write_all(&garbage).await;
                let _ = stream.flush().await;
            });
        }
    });

    Ok(addr)
}
