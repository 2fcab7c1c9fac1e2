//! Fan-out of one frame to every registered connection.

use futures::future::join_all;
use gossipnet_protocol::{Frame, PeerId};

use crate::connection::DirectionFilter;
use crate::registry::{Registry, RemoveReason};

/// Outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    /// Peers whose write failed; they have been removed from the registry.
    pub failed: Vec<PeerId>,
}

/// Send `frame` to every connection except `exclude`.
///
/// Writes run concurrently over a snapshot. Connections that fail are
/// removed afterwards, outside any iteration.
pub async fn broadcast(registry: &Registry, frame: &Frame, exclude: Option<PeerId>) -> BroadcastReport {
    let targets: Vec<_> = registry
        .snapshot(DirectionFilter::Any)
        .await
        .into_iter()
        .filter(|c| Some(c.peer_id()) != exclude)
        .collect();

    let results = join_all(targets.iter().map(|conn| conn.write(frame.clone()))).await;

    let mut report = BroadcastReport::default();
    let mut failed = Vec::new();
    for (conn, result) in targets.iter().zip(results) {
        match result {
            Ok(()) => report.sent += 1,
            Err(_) => failed.push(conn),
        }
    }

    for conn in failed {
        registry.remove(conn, RemoveReason::WriteFailed).await;
        report.failed.push(conn.peer_id());
    }

    if !report.failed.is_empty() {
        tracing::info!(
            command = frame.command(),
            sent = report.sent,
            failed = report.failed.len(),
            "broadcast: pruned peers not responding"
        );
    }
    report
}
