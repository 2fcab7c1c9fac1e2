//! Gossipnet Node -- library crate for the P2P engine.
//!
//! An [`Engine`] listens for peers, dials peers, runs the handshake, keeps
//! one connection per peer identity and routes inbound frames to command
//! handlers. Ping and peer exchange are built in; applications register
//! their own commands next to them.

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod handshake;
pub mod mini_protocols;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use gossipnet_protocol::{Frame, Node, PeerId, CMD_EXCHANGE_PEER_LIST, CMD_PING};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use broadcast::BroadcastReport;
pub use config::NodeConfig;
pub use connection::{Connection, Direction, DirectionFilter};
pub use dispatch::{CommandHandler, DispatchError, Request};
pub use handshake::{HandshakeError, HandshakeOutcome};
pub use registry::{BanPolicy, Registry, RegistryError, RemoveReason};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid listening port 0")]
    InvalidPort,
    #[error("empty peer id")]
    InvalidPeerId,
    #[error("engine already started")]
    AlreadyStarted,
    #[error("engine is shut down")]
    ShutDown,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("dial {target} failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake with {target} failed: {source}")]
    Handshake {
        target: String,
        #[source]
        source: HandshakeError,
    },
}

/// Lifetime counters, read with [`EngineStats::snapshot`].
#[derive(Debug, Default)]
pub struct EngineStats {
    dials_started: AtomicU64,
    handshakes_accepted: AtomicU64,
    handshakes_duplicate: AtomicU64,
    handshakes_rejected: AtomicU64,
    frames_dispatched: AtomicU64,
    unknown_commands: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dials_started: u64,
    /// Handshakes that registered a new connection.
    pub handshakes_accepted: u64,
    /// Handshakes that completed against a peer we were already linked to.
    pub handshakes_duplicate: u64,
    pub handshakes_rejected: u64,
    pub frames_dispatched: u64,
    pub unknown_commands: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dials_started: self.dials_started.load(Ordering::Relaxed),
            handshakes_accepted: self.handshakes_accepted.load(Ordering::Relaxed),
            handshakes_duplicate: self.handshakes_duplicate.load(Ordering::Relaxed),
            handshakes_rejected: self.handshakes_rejected.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            unknown_commands: self.unknown_commands.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_dial(&self) {
        self.dials_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake(&self, result: &Result<HandshakeOutcome, HandshakeError>) {
        let counter = match result {
            Ok(HandshakeOutcome::Registered(_)) => &self.handshakes_accepted,
            Ok(HandshakeOutcome::AlreadyConnected(_)) => &self.handshakes_duplicate,
            Err(_) => &self.handshakes_rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_dispatched(&self) {
        self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unknown_command(&self) {
        self.unknown_commands.fetch_add(1, Ordering::Relaxed);
    }
}

struct EngineInner {
    config: NodeConfig,
    peer_id: PeerId,
    registry: Registry,
    commands: dispatch::CommandTable,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    pending_dials: Mutex<HashSet<String>>,
    local_addr: OnceLock<SocketAddr>,
    stats: EngineStats,
}

/// Handle to a running P2P engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine from `config`. Ping and peer exchange are registered;
    /// nothing listens or dials until [`Engine::start`].
    pub fn new(config: NodeConfig) -> Result<Self, EngineError> {
        if config.network.port == 0 {
            return Err(EngineError::InvalidPort);
        }
        let peer_id = match config.node.peer_id {
            Some(id) if id.is_empty() => return Err(EngineError::InvalidPeerId),
            Some(id) => id,
            None => PeerId::random(),
        };

        let registry = Registry::new(BanPolicy {
            failures_before_ban: config.limits.failures_before_ban,
            ban_duration: config.limits.ban_duration(),
        });

        let commands = dispatch::CommandTable::new();
        commands.register("Ping", CMD_PING, CommandHandler::Ping)?;
        commands.register(
            "ExchangePeerList",
            CMD_EXCHANGE_PEER_LIST,
            CommandHandler::ExchangePeerList,
        )?;

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                peer_id,
                registry,
                commands,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                pending_dials: Mutex::new(HashSet::new()),
                local_addr: OnceLock::new(),
                stats: EngineStats::default(),
            }),
        })
    }

    /// Bind the listener and start accepting peers. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        if self.inner.local_addr.get().is_some() {
            return Err(EngineError::AlreadyStarted);
        }

        let network = &self.inner.config.network;
        let addr = format!("{}:{}", network.listen_host, network.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| EngineError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| EngineError::Bind {
            addr: addr.clone(),
            source,
        })?;
        if self.inner.local_addr.set(local).is_err() {
            return Err(EngineError::AlreadyStarted);
        }

        tracing::info!(
            peer = %self.inner.peer_id.short(),
            net_id = self.net_id(),
            %local,
            "listening for peers"
        );
        self.spawn(transport::listen(self.clone(), listener));
        Ok(local)
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    pub fn net_id(&self) -> u8 {
        self.inner.config.node.net_id
    }

    /// Listening port announced to peers.
    pub fn port(&self) -> u16 {
        self.inner.config.network.port
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn commands(&self) -> &dispatch::CommandTable {
        &self.inner.commands
    }

    pub fn stats(&self) -> &EngineStats {
        &self.inner.stats
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Build a frame stamped with our net id and identity.
    pub fn frame(&self, command: u8, is_request: bool, payload: impl Into<Bytes>) -> Frame {
        Frame::new(self.net_id(), command, is_request, self.inner.peer_id, payload)
    }

    pub fn register_command(
        &self,
        name: &str,
        code: u8,
        handler: CommandHandler,
    ) -> Result<(), EngineError> {
        self.inner.commands.register(name, code, handler)?;
        Ok(())
    }

    /// Dial `host:port` and run the handshake, waiting for the outcome.
    pub async fn dial(&self, host: &str, port: u16) -> Result<HandshakeOutcome, EngineError> {
        transport::dial(self, host, port).await
    }

    /// Dial `host:port` in the background unless a connection to that
    /// endpoint exists or a dial to it is already in flight.
    pub async fn connect_host(&self, host: &str, port: u16) -> bool {
        self.spawn_dial(host, port, None).await
    }

    /// Dial every configured seed node not already connected.
    pub async fn connect_to_seed_nodes(&self) -> usize {
        let mut started = 0;
        for seed in &self.inner.config.network.seed_nodes {
            if self.spawn_dial(&seed.host, seed.port, None).await {
                started += 1;
            }
        }
        started
    }

    /// Dial every node in a received list that is neither us nor already
    /// connected. Each target is dialled at most once at a time.
    pub async fn connect_to_node_list(&self, nodes: &[Node]) -> usize {
        let mut started = 0;
        for node in nodes {
            if node.peer_id == self.inner.peer_id || node.peer_id.is_empty() {
                continue;
            }
            if self.spawn_dial(&node.host, node.port, Some(node.peer_id)).await {
                started += 1;
            }
        }
        started
    }

    /// Periodic: re-bootstrap from the seed list when we have no peers at all.
    pub async fn connect_to_seeds_if_isolated(&self) -> usize {
        if self.connection_count().await > 0 {
            return 0;
        }
        tracing::debug!("no connections, dialling seed nodes");
        self.connect_to_seed_nodes().await
    }

    /// Periodic: send our peer list as a request to every connection.
    pub async fn exchange_peer_lists(&self) -> BroadcastReport {
        let frame = mini_protocols::peer_list_frame(self, true, None).await;
        self.broadcast(frame, None).await
    }

    /// Periodic: ping every connection; unreachable peers are pruned.
    pub async fn ping_peers(&self) -> BroadcastReport {
        self.broadcast(mini_protocols::ping_frame(self, true), None).await
    }

    pub async fn broadcast(&self, frame: Frame, exclude: Option<&Connection>) -> BroadcastReport {
        broadcast::broadcast(&self.inner.registry, &frame, exclude.map(Connection::peer_id)).await
    }

    pub async fn for_each_connection<F>(&self, filter: DirectionFilter, visitor: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        self.inner.registry.for_each(filter, visitor).await
    }

    pub async fn connections(&self, filter: DirectionFilter) -> Vec<Arc<Connection>> {
        self.inner.registry.snapshot(filter).await
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.count().await
    }

    /// Stop listening, close every connection and wait for in-flight tasks.
    pub async fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!(peer = %self.inner.peer_id.short(), "shutting down");
        }
        self.inner.shutdown.cancel();
        self.inner.registry.clear(RemoveReason::Shutdown).await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Run `fut` on the engine's task tracker. Refused once shutdown began.
    pub(crate) fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return false;
        }
        self.inner.tasks.spawn(fut);
        true
    }

    async fn spawn_dial(&self, host: &str, port: u16, peer_id: Option<PeerId>) -> bool {
        if self.is_shut_down() {
            return false;
        }
        if let Some(id) = peer_id {
            if self.inner.registry.is_banned(&id) {
                return false;
            }
        }

        let target = format!("{host}:{port}");
        if !self.begin_dial(&target) {
            tracing::trace!(%target, "dial already in flight");
            return false;
        }

        let registry = &self.inner.registry;
        let connected = match peer_id {
            Some(id) => registry.has_peer(&id).await,
            None => false,
        } || registry.has_endpoint(host, port).await;
        if connected {
            self.end_dial(&target);
            return false;
        }

        self.inner.stats.record_dial();
        let engine = self.clone();
        let host = host.to_string();
        let pending = target.clone();
        let spawned = self.spawn(async move {
            match engine.dial(&host, port).await {
                Ok(HandshakeOutcome::Registered(conn)) => {
                    tracing::debug!(%target, peer = %conn.peer_id().short(), "dial complete");
                }
                Ok(HandshakeOutcome::AlreadyConnected(peer)) => {
                    tracing::debug!(%target, peer = %peer.short(), "dial found existing connection");
                }
                Err(e) => tracing::debug!(%target, "dial failed: {e}"),
            }
            engine.end_dial(&target);
        });
        if !spawned {
            self.end_dial(&pending);
        }
        spawned
    }

    fn begin_dial(&self, target: &str) -> bool {
        self.lock_pending().insert(target.to_string())
    }

    fn end_dial(&self, target: &str) {
        self.lock_pending().remove(target);
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.inner
            .pending_dials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
