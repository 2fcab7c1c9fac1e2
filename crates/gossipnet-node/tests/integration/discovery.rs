//! Seed bootstrap and peer-list exchange across several engines.

use std::time::Duration;

use crate::harness::{TestNode, TestNodeBuilder, TIMEOUT};

/// A hub with two spokes, each spoke knowing only the hub.
async fn star() -> (TestNode, TestNode, TestNode) {
    let hub = TestNodeBuilder::new("hub").build().await.unwrap();
    let b = TestNodeBuilder::new("b").seed(&hub).build().await.unwrap();
    let c = TestNodeBuilder::new("c").seed(&hub).build().await.unwrap();

    b.engine.connect_to_seed_nodes().await;
    c.engine.connect_to_seed_nodes().await;
    hub.wait_connections(2, TIMEOUT).await.unwrap();
    b.wait_connections(1, TIMEOUT).await.unwrap();
    c.wait_connections(1, TIMEOUT).await.unwrap();
    (hub, b, c)
}

#[tokio::test]
async fn test_isolated_node_dials_seeds() {
    let a = TestNodeBuilder::new("a").build().await.unwrap();
    let b = TestNodeBuilder::new("b").seed(&a).build().await.unwrap();

    assert_eq!(b.engine.connect_to_seeds_if_isolated().await, 1);
    b.wait_connections(1, TIMEOUT).await.unwrap();
    assert_eq!(b.engine.connect_to_seeds_if_isolated().await, 0);

    b.shutdown().await;
    a.shutdown().await;
}

/// b learns c from the hub's reply and dials it exactly once.
#[tokio::test]
async fn test_peer_exchange_forms_full_mesh() {
    let (hub, b, c) = star().await;

    let report = b.engine.exchange_peer_lists().await;
    assert_eq!(report.sent, 1);
    assert!(report.failed.is_empty());

    b.wait_connected_to(&c, TIMEOUT).await.unwrap();
    c.wait_connections(2, TIMEOUT).await.unwrap();
    b.wait_connections(2, TIMEOUT).await.unwrap();

    // c is advertised by its listening port, not the ephemeral one
    let c_on_b = b.connection_to(&c).await.unwrap();
    assert_eq!(c_on_b.port(), c.port());

    // a second round finds nothing new to dial
    b.engine.exchange_peer_lists().await;
    c.engine.exchange_peer_lists().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(b.engine.stats().snapshot().dials_started, 2);
    assert_eq!(c.engine.stats().snapshot().dials_started, 1);
    assert_eq!(hub.engine.stats().snapshot().dials_started, 0);
    for node in [&hub, &b, &c] {
        assert_eq!(node.count().await, 2, "{}", node.name);
    }

    c.shutdown().await;
    b.shutdown().await;
    hub.shutdown().await;
}

/// The hub answering a request never advertises the requester to itself.
#[tokio::test]
async fn test_exchange_with_single_peer_dials_nothing() {
    let a = TestNodeBuilder::new("a").build().await.unwrap();
    let b = TestNodeBuilder::new("b").seed(&a).build().await.unwrap();
    b.engine.connect_to_seed_nodes().await;
    a.wait_connections(1, TIMEOUT).await.unwrap();
    b.wait_connections(1, TIMEOUT).await.unwrap();

    b.engine.exchange_peer_lists().await;
    a.engine.exchange_peer_lists().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(a.engine.stats().snapshot().dials_started, 0);
    assert_eq!(b.engine.stats().snapshot().dials_started, 1);
    assert_eq!(a.count().await, 1);
    assert_eq!(b.count().await, 1);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_ping_keeps_connections() {
    let (hub, b, c) = star().await;

    let report = hub.engine.ping_peers().await;
    assert_eq!(report.sent, 2);
    assert!(report.failed.is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hub.count().await, 2);
    assert!(b.engine.stats().snapshot().frames_dispatched >= 1);
    assert!(c.engine.stats().snapshot().frames_dispatched >= 1);

    c.shutdown().await;
    b.shutdown().await;
    hub.shutdown().await;
}
