//! TCP transport -- accept loop, dialling, per-connection read loop.

use std::sync::Arc;

use futures::StreamExt;
use gossipnet_protocol::{FrameCodec, ProtocolError};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;

use crate::connection::Connection;
use crate::handshake::{self, HandshakeOutcome};
use crate::registry::RemoveReason;
use crate::{Engine, EngineError};

/// Run the accept loop -- one handshake task per inbound socket.
pub(crate) async fn listen(engine: Engine, listener: TcpListener) {
    let shutdown = engine.shutdown_token().clone();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        tracing::debug!(%remote, "accepted inbound socket");
                        let engine2 = engine.clone();
                        engine.spawn(async move {
                            let shutdown = engine2.shutdown_token().clone();
                            tokio::select! {
                                result = handshake::accept(&engine2, stream) => match result {
                                    Ok(HandshakeOutcome::Registered(conn)) => {
                                        tracing::info!(
                                            peer = %conn.peer_id().short(),
                                            %remote,
                                            port = conn.port(),
                                            "inbound peer connected"
                                        );
                                    }
                                    Ok(HandshakeOutcome::AlreadyConnected(peer)) => {
                                        tracing::debug!(peer = %peer.short(), %remote, "inbound duplicate closed");
                                    }
                                    Err(e) => tracing::warn!(%remote, "inbound handshake failed: {e}"),
                                },
                                _ = shutdown.cancelled() => {}
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("failed to accept connection: {e}");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown signal, stopping accept loop");
                break;
            }
        }
    }
}

/// Connect to `host:port` and run the initiator side of the handshake.
pub(crate) async fn dial(engine: &Engine, host: &str, port: u16) -> Result<HandshakeOutcome, EngineError> {
    let target = format!("{host}:{port}");
    let timeout = engine.config().limits.handshake_timeout();
    let shutdown = engine.shutdown_token().clone();

    let stream = tokio::select! {
        connected = tokio::time::timeout(timeout, TcpStream::connect((host, port))) => match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(EngineError::Dial { target, source }),
            Err(_) => {
                return Err(EngineError::Dial {
                    target,
                    source: std::io::ErrorKind::TimedOut.into(),
                })
            }
        },
        _ = shutdown.cancelled() => return Err(EngineError::ShutDown),
    };

    let outcome = tokio::select! {
        result = handshake::initiate(engine, stream) => {
            result.map_err(|source| EngineError::Handshake { target: target.clone(), source })?
        }
        _ = shutdown.cancelled() => return Err(EngineError::ShutDown),
    };

    if let HandshakeOutcome::Registered(conn) = &outcome {
        tracing::info!(
            peer = %conn.peer_id().short(),
            %target,
            "outbound peer connected"
        );
    }
    Ok(outcome)
}

/// Read frames from one connection until it closes, handing each to dispatch.
/// On exit the connection is removed from the registry, only if it is still
/// the registered link for its peer.
pub(crate) async fn run_connection(engine: Engine, conn: Arc<Connection>, read: OwnedReadHalf) {
    let mut frames = FramedRead::new(read, FrameCodec::new(engine.net_id()));
    let shutdown = engine.shutdown_token().clone();

    let reason = loop {
        tokio::select! {
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    // dispatch spawns; the read loop never waits on a handler
                    engine.commands().process(&engine, conn.clone(), frame);
                }
                // socket-level failure, not the peer's fault
                Some(Err(ProtocolError::Io(e))) => {
                    tracing::debug!(peer = %conn.peer_id().short(), "read error: {e}");
                    break Some(RemoveReason::Closed);
                }
                // framing violation: drop the peer and count a strike
                Some(Err(e)) => {
                    tracing::warn!(peer = %conn.peer_id().short(), remote = %conn.address(), "dropping peer: {e}");
                    break Some(RemoveReason::Malformed(e.to_string()));
                }
                None => break Some(RemoveReason::Closed),
            },
            // closed by the registry or a lost registration race; nothing to remove
            _ = conn.closed() => break None,
            _ = shutdown.cancelled() => break Some(RemoveReason::Shutdown),
        }
    };

    if let Some(reason) = reason {
        engine.registry().remove(&conn, reason).await;
    }
}
