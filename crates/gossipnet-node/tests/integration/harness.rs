//! Test harness for in-process gossipnet-node integration tests.
//!
//! Provides TestNode (one started engine on a loopback port) and
//! TestNodeBuilder (config) for running real TCP engines in the same tokio
//! runtime.

use std::time::Duration;

use gossipnet_node::config::NodeConfig;
use gossipnet_node::{Connection, DirectionFilter, Engine};
use gossipnet_protocol::PeerId;

/// A free loopback port. The probe socket is closed before returning.
pub fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    probe.local_addr().expect("probe addr").port()
}

/// A started engine listening on 127.0.0.1.
pub struct TestNode {
    pub name: String,
    pub engine: Engine,
}

#[allow(dead_code)]
impl TestNode {
    pub fn peer_id(&self) -> PeerId {
        self.engine.peer_id()
    }

    pub fn port(&self) -> u16 {
        self.engine.port()
    }

    pub async fn count(&self) -> usize {
        self.engine.connection_count().await
    }

    pub async fn connection_to(&self, peer: &TestNode) -> Option<std::sync::Arc<Connection>> {
        self.engine.registry().get(&peer.peer_id()).await
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await;
    }

    /// Poll until connection count == n, or timeout.
    pub async fn wait_connections(&self, n: usize, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let count = self.count().await;
            if count == n {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                let peers: Vec<String> = self
                    .engine
                    .connections(DirectionFilter::Any)
                    .await
                    .iter()
                    .map(|c| format!("{}@{}", c.peer_id().short(), c.port()))
                    .collect();
                anyhow::bail!(
                    "{}: timeout waiting for {} connections (have {}): {:?}",
                    self.name,
                    n,
                    count,
                    peers,
                );
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Poll until connected to `peer`, or timeout.
    pub async fn wait_connected_to(&self, peer: &TestNode, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.engine.registry().has_peer(&peer.peer_id()).await {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("{}: timeout waiting for {}", self.name, peer.name);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

pub struct TestNodeBuilder {
    name: String,
    config: NodeConfig,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(name: &str) -> Self {
        let mut config = NodeConfig::default();
        config.network.listen_host = "127.0.0.1".into();
        config.network.port = free_port();
        config.limits.handshake_timeout_secs = 5;
        Self {
            name: name.to_string(),
            config,
        }
    }

    pub fn net_id(mut self, net_id: u8) -> Self {
        self.config.node.net_id = net_id;
        self
    }

    pub fn peer_id(mut self, peer_id: PeerId) -> Self {
        self.config.node.peer_id = Some(peer_id);
        self
    }

    pub fn seed(mut self, node: &TestNode) -> Self {
        self.config.network.add_seed_node("127.0.0.1", node.port());
        self
    }

    pub fn max_shared_peers(mut self, max: usize) -> Self {
        self.config.limits.max_shared_peers = max;
        self
    }

    /// Build the engine without starting it, for registering commands first.
    pub fn engine(self) -> anyhow::Result<TestNode> {
        Ok(TestNode {
            name: self.name,
            engine: Engine::new(self.config)?,
        })
    }

    pub async fn build(self) -> anyhow::Result<TestNode> {
        let node = self.engine()?;
        node.engine.start().await?;
        Ok(node)
    }
}

pub const TIMEOUT: Duration = Duration::from_secs(10);
