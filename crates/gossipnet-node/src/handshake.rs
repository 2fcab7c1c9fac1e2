//! Handshake -- the first exchange on every fresh socket.
//!
//! Both sides send a handshake frame carrying their identity and listening
//! port. The initiator sends a request and waits for the response; the
//! acceptor validates the request, acknowledges, then registers. A peer
//! that is already connected gets the acknowledgement as a courtesy and
//! the new socket is closed.
//!
//! The whole exchange is bounded by `limits.handshake_timeout_secs` and the
//! frame by [`HANDSHAKE_BUFFER_SIZE`].

use std::sync::Arc;

use gossipnet_protocol::{
    Frame, HandshakePayload, Header, PeerId, ProtocolError, CMD_HANDSHAKE, HANDSHAKE_BUFFER_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::connection::{Connection, Direction};
use crate::registry::{RegistryError, RemoveReason};
use crate::{transport, Engine};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("expected handshake, got command {0}")]
    UnexpectedCommand(u8),
    #[error("connection to self")]
    SelfConnection,
    #[error("empty peer id")]
    EmptyPeerId,
    #[error("header sender {header} does not match announced id {announced}")]
    IdMismatch { header: PeerId, announced: PeerId },
    #[error("peer {0} is banned")]
    Banned(PeerId),
}

#[derive(Debug)]
pub enum HandshakeOutcome {
    /// A new connection was registered and its read loop started.
    Registered(Arc<Connection>),
    /// The peer already had a connection; the new socket was closed.
    AlreadyConnected(PeerId),
}

/// Handshake frame announcing our identity and listening port.
pub fn handshake_frame(engine: &Engine, is_request: bool) -> Frame {
    let payload = HandshakePayload {
        peer_id: engine.peer_id(),
        port: engine.port(),
    };
    engine.frame(CMD_HANDSHAKE, is_request, payload.encode())
}

/// Acceptor side, run on a freshly accepted socket.
pub async fn accept(engine: &Engine, stream: TcpStream) -> Result<HandshakeOutcome, HandshakeError> {
    let timeout = engine.config().limits.handshake_timeout();
    let result = tokio::time::timeout(timeout, accept_inner(engine, stream))
        .await
        .unwrap_or(Err(HandshakeError::Timeout));
    engine.stats().record_handshake(&result);
    result
}

/// Initiator side, run on a freshly dialled socket.
pub async fn initiate(engine: &Engine, stream: TcpStream) -> Result<HandshakeOutcome, HandshakeError> {
    let timeout = engine.config().limits.handshake_timeout();
    let result = tokio::time::timeout(timeout, initiate_inner(engine, stream))
        .await
        .unwrap_or(Err(HandshakeError::Timeout));
    engine.stats().record_handshake(&result);
    result
}

async fn accept_inner(engine: &Engine, mut stream: TcpStream) -> Result<HandshakeOutcome, HandshakeError> {
    let remote = read_handshake(&mut stream, engine.net_id(), engine.peer_id()).await?;
    if engine.registry().is_banned(&remote.peer_id) {
        return Err(HandshakeError::Banned(remote.peer_id));
    }

    if engine.registry().has_peer(&remote.peer_id).await {
        if let Err(e) = send_handshake(engine, &mut stream, false).await {
            tracing::debug!(peer = %remote.peer_id.short(), "courtesy ack failed: {e}");
        }
        tracing::debug!(peer = %remote.peer_id.short(), "handshake: already connected, courtesy ack sent");
        return Ok(HandshakeOutcome::AlreadyConnected(remote.peer_id));
    }

    send_handshake(engine, &mut stream, false).await?;
    register(engine, stream, remote, Direction::Incoming).await
}

async fn initiate_inner(engine: &Engine, mut stream: TcpStream) -> Result<HandshakeOutcome, HandshakeError> {
    send_handshake(engine, &mut stream, true).await?;
    let remote = read_handshake(&mut stream, engine.net_id(), engine.peer_id()).await?;
    if engine.registry().is_banned(&remote.peer_id) {
        return Err(HandshakeError::Banned(remote.peer_id));
    }

    if engine.registry().has_peer(&remote.peer_id).await {
        if let Err(e) = send_handshake(engine, &mut stream, false).await {
            tracing::debug!(peer = %remote.peer_id.short(), "courtesy ack failed: {e}");
        }
        tracing::debug!(peer = %remote.peer_id.short(), "handshake: already connected, closing new socket");
        return Ok(HandshakeOutcome::AlreadyConnected(remote.peer_id));
    }

    register(engine, stream, remote, Direction::Outgoing).await
}

async fn send_handshake(
    engine: &Engine,
    stream: &mut TcpStream,
    is_request: bool,
) -> Result<(), HandshakeError> {
    let bytes = handshake_frame(engine, is_request).to_bytes();
    stream.write_all(&bytes).await?;
    Ok(())
}

async fn register(
    engine: &Engine,
    stream: TcpStream,
    remote: HandshakePayload,
    direction: Direction,
) -> Result<HandshakeOutcome, HandshakeError> {
    let (conn, read) = Connection::new(stream, remote.peer_id, remote.port, direction, engine.net_id())?;

    match engine.registry().add(conn.clone()).await {
        Ok(()) => {}
        Err(RegistryError::AlreadyConnected(peer)) => {
            conn.close().await;
            return Ok(HandshakeOutcome::AlreadyConnected(peer));
        }
        Err(RegistryError::Banned(peer)) => {
            conn.close().await;
            return Err(HandshakeError::Banned(peer));
        }
    }

    if !engine.spawn(transport::run_connection(engine.clone(), conn.clone(), read)) {
        engine.registry().remove(&conn, RemoveReason::Shutdown).await;
    }
    Ok(HandshakeOutcome::Registered(conn))
}

/// Read and validate one handshake frame.
///
/// Reads exactly the header, then exactly the declared payload. Rejects a
/// foreign net id, any other command, a payload that is not a handshake
/// payload, an empty or mismatched sender id, and our own id.
pub async fn read_handshake<R>(
    reader: &mut R,
    net_id: u8,
    local: PeerId,
) -> Result<HandshakePayload, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; Header::LENGTH];
    reader.read_exact(&mut head).await?;
    let header = Header::parse(&head)?;

    if header.net_id != net_id {
        return Err(ProtocolError::NetMismatch {
            expected: net_id,
            got: header.net_id,
        }
        .into());
    }
    if header.command != CMD_HANDSHAKE {
        return Err(HandshakeError::UnexpectedCommand(header.command));
    }
    if header.frame_len() > HANDSHAKE_BUFFER_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: header.data_length as usize,
            max: HANDSHAKE_BUFFER_SIZE - Header::LENGTH,
        }
        .into());
    }

    let mut payload = vec![0u8; header.data_length as usize];
    reader.read_exact(&mut payload).await?;
    let announced = HandshakePayload::decode(&payload)?;

    if announced.peer_id.is_empty() {
        return Err(HandshakeError::EmptyPeerId);
    }
    if announced.peer_id == local || header.peer_id == local {
        return Err(HandshakeError::SelfConnection);
    }
    if header.peer_id != announced.peer_id {
        return Err(HandshakeError::IdMismatch {
            header: header.peer_id,
            announced: announced.peer_id,
        });
    }
    Ok(announced)
}
