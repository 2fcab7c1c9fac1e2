//! Application commands registered next to the built-in protocols.

use std::time::Duration;

use bytes::Bytes;
use gossipnet_node::CommandHandler;
use tokio::sync::mpsc;

use crate::harness::{TestNode, TestNodeBuilder, TIMEOUT};

const ECHO: u8 = 42;

/// Requests are echoed back as responses; responses land in the channel.
fn echo_handler(name: &'static str, tx: mpsc::UnboundedSender<(&'static str, bool, Bytes)>) -> CommandHandler {
    CommandHandler::custom(move |req| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((name, req.header.is_request, req.payload.clone()));
            if req.header.is_request {
                let reply = req.engine.frame(ECHO, false, req.payload);
                let _ = req.connection.write(reply).await;
            }
        }
    })
}

async fn echo_node(name: &'static str, tx: mpsc::UnboundedSender<(&'static str, bool, Bytes)>, seed: Option<&TestNode>) -> TestNode {
    let mut builder = TestNodeBuilder::new(name);
    if let Some(seed) = seed {
        builder = builder.seed(seed);
    }
    let node = builder.engine().unwrap();
    node.engine.register_command("Echo", ECHO, echo_handler(name, tx)).unwrap();
    node.engine.start().await.unwrap();
    node
}

#[tokio::test]
async fn test_custom_command_round_trip() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let a = echo_node("a", tx.clone(), None).await;
    let b = echo_node("b", tx, Some(&a)).await;
    b.engine.connect_to_seed_nodes().await;
    b.wait_connected_to(&a, TIMEOUT).await.unwrap();

    let conn = b.connection_to(&a).await.unwrap();
    conn.write(b.engine.frame(ECHO, true, Bytes::from_static(b"hello")))
        .await
        .unwrap();

    let first = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, ("a", true, Bytes::from_static(b"hello")));
    let second = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(second, ("b", false, Bytes::from_static(b"hello")));

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_skips_excluded_connection() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let hub = echo_node("hub", tx.clone(), None).await;
    let b = echo_node("b", tx.clone(), Some(&hub)).await;
    let c = echo_node("c", tx, Some(&hub)).await;
    b.engine.connect_to_seed_nodes().await;
    c.engine.connect_to_seed_nodes().await;
    hub.wait_connections(2, TIMEOUT).await.unwrap();

    let to_b = hub.connection_to(&b).await.unwrap();
    let frame = hub.engine.frame(ECHO, true, Bytes::from_static(b"fan-out"));
    let report = hub.engine.broadcast(frame, Some(to_b.as_ref())).await;
    assert_eq!(report.sent, 1);
    assert!(report.failed.is_empty());

    let first = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.0, "c");
    assert!(first.1);
    let echoed = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(echoed.0, "hub");
    assert!(!echoed.1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err(), "b must not receive the broadcast");

    c.shutdown().await;
    b.shutdown().await;
    hub.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_command_ignored() {
    let a = TestNodeBuilder::new("a").build().await.unwrap();
    let b = TestNodeBuilder::new("b").seed(&a).build().await.unwrap();
    b.engine.connect_to_seed_nodes().await;
    b.wait_connected_to(&a, TIMEOUT).await.unwrap();

    let conn = b.connection_to(&a).await.unwrap();
    conn.write(b.engine.frame(ECHO, true, Bytes::from_static(b"?")))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while a.engine.stats().snapshot().unknown_commands == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(a.count().await, 1);

    b.shutdown().await;
    a.shutdown().await;
}
