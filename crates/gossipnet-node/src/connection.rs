//! A live, handshaken TCP link to one remote peer.
//!
//! The write half sits behind an async mutex so frames from concurrent
//! producers (handlers, broadcast) never interleave on the wire. The read
//! half is handed back to the caller, which drives the read loop.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use futures::SinkExt;
use gossipnet_protocol::{Frame, FrameCodec, PeerId, ProtocolError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction mask for iterating connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectionFilter {
    Incoming,
    Outgoing,
    #[default]
    Any,
}

impl DirectionFilter {
    pub fn matches(&self, direction: Direction) -> bool {
        match self {
            DirectionFilter::Incoming => direction == Direction::Incoming,
            DirectionFilter::Outgoing => direction == Direction::Outgoing,
            DirectionFilter::Any => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("write failed: {0}")]
    Write(#[from] ProtocolError),
}

type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

pub struct Connection {
    id: u64,
    peer_id: PeerId,
    port: u16,
    address: SocketAddr,
    direction: Direction,
    failures: AtomicU32,
    writer: Mutex<Option<FrameWriter>>,
    closed: CancellationToken,
}

impl Connection {
    /// Wrap a handshaken stream. `port` is the remote's listening port as
    /// announced in the handshake, not the socket's ephemeral port.
    pub fn new(
        stream: TcpStream,
        peer_id: PeerId,
        port: u16,
        direction: Direction,
        net_id: u8,
    ) -> std::io::Result<(Arc<Self>, OwnedReadHalf)> {
        let address = stream.peer_addr()?;
        let (read, write) = stream.into_split();

        let conn = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_id,
            port,
            address,
            direction,
            failures: AtomicU32::new(0),
            writer: Mutex::new(Some(FramedWrite::new(write, FrameCodec::new(net_id)))),
            closed: CancellationToken::new(),
        };
        Ok((Arc::new(conn), read))
    }

    /// Write one frame. Only one write is in flight per socket.
    ///
    /// Failure bumps the consecutive-failure counter and is returned to the
    /// caller; the socket is left as is; removal is the caller's decision.
    pub async fn write(&self, frame: Frame) -> Result<(), ConnectionError> {
        let mut guard = self.writer.lock().await;
        let result = match guard.as_mut() {
            Some(writer) => tokio::select! {
                sent = writer.send(frame) => sent.map_err(ConnectionError::from),
                _ = self.closed.cancelled() => Err(ConnectionError::Closed),
            },
            None => Err(ConnectionError::Closed),
        };

        match &result {
            Ok(()) => self.failures.store(0, Ordering::Relaxed),
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    peer = %self.peer_id.short(),
                    remote = %self.address,
                    failures,
                    "write failed: {e}"
                );
            }
        }
        result
    }

    /// Close the socket. Idempotent. Does not touch the registry.
    pub async fn close(&self) {
        self.closed.cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.get_mut().shutdown().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Process-unique id distinguishing this socket from later ones to the same peer.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Remote listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Consecutive write failures since the last successful write.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Remote IP with IPv4-mapped addresses unmapped.
    pub fn ip(&self) -> IpAddr {
        unmap_ip(self.address.ip())
    }

    /// Whether this connection reaches `host:port` (remote IP + listening port).
    pub fn matches_endpoint(&self, host: &str, port: u16) -> bool {
        if self.port != port {
            return false;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => unmap_ip(ip) == self.ip(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("direction", &self.direction)
            .field("failures", &self.failures())
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) fn unmap_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
