//! Connection registry -- concurrency-safe table of established connections.
//!
//! Maps PeerId → Connection, at most one entry per peer. Check-and-insert
//! happens under a single write lock so racing handshakes for the same peer
//! resolve to exactly one winner. Iteration works on a snapshot taken under
//! a short read lock; visitors never run while the lock is held.
//!
//! Also tracks strikes per peer identity: removals caused by write failures
//! or malformed input count against the peer, and enough of them ban it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gossipnet_protocol::PeerId;
use tokio::sync::RwLock;

use crate::connection::{Connection, DirectionFilter};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("already connected to {0}")]
    AlreadyConnected(PeerId),
    #[error("peer {0} is banned")]
    Banned(PeerId),
}

/// Why a connection left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveReason {
    WriteFailed,
    Malformed(String),
    Closed,
    Shutdown,
    Other(String),
}

impl RemoveReason {
    /// Whether the removal counts as a strike against the peer.
    pub fn is_strike(&self) -> bool {
        matches!(self, RemoveReason::WriteFailed | RemoveReason::Malformed(_))
    }
}

impl fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoveReason::WriteFailed => f.write_str("write failed"),
            RemoveReason::Malformed(detail) => write!(f, "malformed frame: {detail}"),
            RemoveReason::Closed => f.write_str("closed by peer"),
            RemoveReason::Shutdown => f.write_str("shutdown"),
            RemoveReason::Other(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BanPolicy {
    pub failures_before_ban: u32,
    pub ban_duration: Duration,
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self {
            failures_before_ban: 3,
            ban_duration: Duration::from_secs(600),
        }
    }
}

#[derive(Default)]
struct BanList {
    strikes: HashMap<PeerId, u32>,
    banned: HashMap<PeerId, Instant>,
}

impl BanList {
    fn is_banned(&mut self, peer_id: &PeerId) -> bool {
        match self.banned.get(peer_id) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                self.banned.remove(peer_id);
                false
            }
            None => false,
        }
    }

    /// Record a strike. Returns true if this strike banned the peer.
    fn strike(&mut self, peer_id: PeerId, policy: &BanPolicy) -> bool {
        let strikes = self.strikes.entry(peer_id).or_insert(0);
        *strikes += 1;
        if *strikes < policy.failures_before_ban {
            return false;
        }
        self.strikes.remove(&peer_id);
        self.banned
            .insert(peer_id, Instant::now() + policy.ban_duration);
        true
    }
}

/// Shared table of live connections. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<PeerId, Arc<Connection>>>>,
    bans: Arc<Mutex<BanList>>,
    policy: BanPolicy,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(BanPolicy::default())
    }
}

impl Registry {
    pub fn new(policy: BanPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            bans: Arc::new(Mutex::new(BanList::default())),
            policy,
        }
    }

    /// Register a handshaken connection.
    ///
    /// Rejected if the peer already has a connection (the existing link is
    /// kept) or is currently banned.
    pub async fn add(&self, conn: Arc<Connection>) -> Result<(), RegistryError> {
        let peer_id = conn.peer_id();
        if self.is_banned(&peer_id) {
            return Err(RegistryError::Banned(peer_id));
        }

        let pool_size = {
            let mut pool = self.inner.write().await;
            if pool.contains_key(&peer_id) {
                return Err(RegistryError::AlreadyConnected(peer_id));
            }
            pool.insert(peer_id, conn.clone());
            pool.len()
        };

        tracing::info!(
            peer = %peer_id.short(),
            remote = %conn.address(),
            port = conn.port(),
            direction = conn.direction().as_str(),
            pool_size,
            "registry: connection added"
        );
        Ok(())
    }

    /// Close `conn` and drop its entry.
    ///
    /// The entry is only deleted if it still refers to this very connection,
    /// so a stale caller cannot evict a newer link to the same peer.
    /// Returns whether an entry was deleted.
    pub async fn remove(&self, conn: &Connection, reason: RemoveReason) -> bool {
        conn.close().await;

        let peer_id = conn.peer_id();
        let removed = {
            let mut pool = self.inner.write().await;
            let is_current = pool.get(&peer_id).is_some_and(|c| c.id() == conn.id());
            if is_current {
                pool.remove(&peer_id);
            }
            is_current.then(|| pool.len())
        };

        let Some(pool_size) = removed else {
            tracing::debug!(peer = %peer_id.short(), %reason, "registry: stale removal ignored");
            return false;
        };

        tracing::info!(
            peer = %peer_id.short(),
            remote = %conn.address(),
            %reason,
            pool_size,
            "registry: connection removed"
        );

        if reason.is_strike() {
            let banned = self.lock_bans().strike(peer_id, &self.policy);
            if banned {
                tracing::warn!(
                    peer = %peer_id.short(),
                    ban_secs = self.policy.ban_duration.as_secs(),
                    "registry: peer banned after repeated failures"
                );
            }
        }
        true
    }

    pub async fn get(&self, peer_id: &PeerId) -> Option<Arc<Connection>> {
        self.inner.read().await.get(peer_id).cloned()
    }

    pub async fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.inner.read().await.contains_key(peer_id)
    }

    /// Whether any connection reaches `host:port` (remote IP + listening port).
    pub async fn has_endpoint(&self, host: &str, port: u16) -> bool {
        self.inner
            .read()
            .await
            .values()
            .any(|c| c.matches_endpoint(host, port))
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Point-in-time copy of the connections matching `filter`.
    pub async fn snapshot(&self, filter: DirectionFilter) -> Vec<Arc<Connection>> {
        self.inner
            .read()
            .await
            .values()
            .filter(|c| filter.matches(c.direction()))
            .cloned()
            .collect()
    }

    /// Visit every connection matching `filter`.
    ///
    /// Runs over a snapshot: connections added or removed while visiting may
    /// or may not be seen.
    pub async fn for_each<F>(&self, filter: DirectionFilter, mut visitor: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for conn in self.snapshot(filter).await {
            visitor(&conn);
        }
    }

    pub fn is_banned(&self, peer_id: &PeerId) -> bool {
        self.lock_bans().is_banned(peer_id)
    }

    /// Close and drop every connection.
    pub async fn clear(&self, reason: RemoveReason) {
        let drained: Vec<Arc<Connection>> = self.inner.write().await.drain().map(|(_, c)| c).collect();
        for conn in &drained {
            conn.close().await;
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), %reason, "registry: cleared");
        }
    }

    fn lock_bans(&self) -> std::sync::MutexGuard<'_, BanList> {
        self.bans.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
