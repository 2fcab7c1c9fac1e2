//! Built-in command handlers.
//!
//! Two protocols ride on every connection next to application commands:
//!   1. Ping -- empty request, empty response; a failed reply drops the peer
//!   2. Peer exchange -- share the peers we are connected to, dial the ones
//!      we learn about

use gossipnet_protocol::{Frame, Node, PeerId, PeerList, CMD_EXCHANGE_PEER_LIST, CMD_PING};
use rand::seq::SliceRandom;

use crate::connection::DirectionFilter;
use crate::dispatch::Request;
use crate::registry::RemoveReason;
use crate::Engine;

// ============================================================================
// Ping
// ============================================================================

pub fn ping_frame(engine: &Engine, is_request: bool) -> Frame {
    engine.frame(CMD_PING, is_request, Vec::new())
}

/// Answer ping requests. Responses need no action.
pub async fn handle_ping(req: Request) {
    if !req.header.is_request {
        return;
    }

    let reply = ping_frame(&req.engine, false);
    if let Err(e) = req.connection.write(reply).await {
        tracing::debug!(peer = %req.connection.peer_id().short(), "ping reply failed: {e}");
        req.engine
            .registry()
            .remove(&req.connection, RemoveReason::WriteFailed)
            .await;
    }
}

// ============================================================================
// Peer exchange
// ============================================================================

/// Peers we can vouch for: every registered connection except `exclude`,
/// advertised by remote IP and listening port. Capped at
/// `limits.max_shared_peers`, picked at random when over.
pub async fn shareable_nodes(engine: &Engine, exclude: Option<PeerId>) -> Vec<Node> {
    let mut nodes: Vec<Node> = engine
        .connections(DirectionFilter::Any)
        .await
        .into_iter()
        .filter(|c| Some(c.peer_id()) != exclude)
        .map(|c| Node::new(c.ip().to_string(), c.port(), c.peer_id()))
        .collect();

    let max = engine
        .config()
        .limits
        .max_shared_peers
        .min(PeerList::MAX_NODES);
    if nodes.len() > max {
        nodes.shuffle(&mut rand::thread_rng());
        nodes.truncate(max);
    }
    nodes
}

/// Peer-list frame carrying [`shareable_nodes`].
pub async fn peer_list_frame(engine: &Engine, is_request: bool, exclude: Option<PeerId>) -> Frame {
    let list = PeerList::new(shareable_nodes(engine, exclude).await);
    engine.frame(CMD_EXCHANGE_PEER_LIST, is_request, list.encode())
}

/// Handle an inbound peer list.
///
/// A request may arrive without a list of its own; it is still answered
/// with our list (minus the requester). Received nodes are handed to the
/// connector, which skips ourselves and peers we already have.
pub async fn handle_peer_list(req: Request) {
    let peer = req.connection.peer_id();
    let list = if req.header.is_request && req.payload.is_empty() {
        PeerList::default()
    } else {
        match PeerList::decode(&req.payload) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(peer = %peer.short(), "bad peer list: {e}");
                return;
            }
        }
    };

    if req.header.is_request {
        let reply = peer_list_frame(&req.engine, false, Some(peer)).await;
        if let Err(e) = req.connection.write(reply).await {
            tracing::debug!(peer = %peer.short(), "peer list reply failed: {e}");
            req.engine
                .registry()
                .remove(&req.connection, RemoveReason::WriteFailed)
                .await;
            return;
        }
    }

    if list.is_empty() {
        return;
    }
    let received = list.len();
    let dialled = req.engine.connect_to_node_list(&list.nodes).await;
    tracing::debug!(peer = %peer.short(), received, dialled, "peer list processed");
}
