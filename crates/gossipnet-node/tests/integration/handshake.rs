//! Connection establishment between real engines.

use std::time::Duration;

use gossipnet_node::{Direction, DirectionFilter, EngineError, HandshakeError, HandshakeOutcome};

use crate::harness::{TestNodeBuilder, TIMEOUT};

/// B dials A from its seed list; both sides register exactly one link.
#[tokio::test]
async fn test_two_nodes_connect() {
    let a = TestNodeBuilder::new("a").build().await.unwrap();
    let b = TestNodeBuilder::new("b").seed(&a).build().await.unwrap();

    assert_eq!(b.engine.connect_to_seed_nodes().await, 1);
    a.wait_connections(1, TIMEOUT).await.unwrap();
    b.wait_connections(1, TIMEOUT).await.unwrap();

    let on_a = a.connection_to(&b).await.unwrap();
    assert_eq!(on_a.port(), b.port());
    assert_eq!(on_a.direction(), Direction::Incoming);

    let on_b = b.connection_to(&a).await.unwrap();
    assert_eq!(on_b.port(), a.port());
    assert_eq!(on_b.direction(), Direction::Outgoing);

    let mut incoming = Vec::new();
    a.engine
        .for_each_connection(DirectionFilter::Incoming, |c| incoming.push(c.peer_id()))
        .await;
    assert_eq!(incoming, vec![b.peer_id()]);
    let mut outgoing = 0;
    a.engine
        .for_each_connection(DirectionFilter::Outgoing, |_| outgoing += 1)
        .await;
    assert_eq!(outgoing, 0);

    assert_eq!(a.engine.stats().snapshot().handshakes_accepted, 1);
    assert_eq!(b.engine.stats().snapshot().dials_started, 1);

    b.shutdown().await;
    a.shutdown().await;
}

/// Reconnecting to a connected peer leaves the single existing link alone.
#[tokio::test]
async fn test_redial_keeps_single_connection() {
    let a = TestNodeBuilder::new("a").build().await.unwrap();
    let b = TestNodeBuilder::new("b").seed(&a).build().await.unwrap();

    b.engine.connect_to_seed_nodes().await;
    a.wait_connections(1, TIMEOUT).await.unwrap();
    b.wait_connections(1, TIMEOUT).await.unwrap();
    let first = b.connection_to(&a).await.unwrap();

    assert!(!b.engine.connect_host("127.0.0.1", a.port()).await);
    assert_eq!(b.engine.connect_to_seed_nodes().await, 0);

    let outcome = b.engine.dial("127.0.0.1", a.port()).await.unwrap();
    assert!(matches!(outcome, HandshakeOutcome::AlreadyConnected(p) if p == a.peer_id()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.count().await, 1);
    assert_eq!(b.count().await, 1);
    assert_eq!(b.connection_to(&a).await.unwrap().id(), first.id());
    assert!(!first.is_closed());

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_foreign_network_rejected() {
    let a = TestNodeBuilder::new("a").net_id(1).build().await.unwrap();
    let b = TestNodeBuilder::new("b").net_id(2).build().await.unwrap();

    let err = b.engine.dial("127.0.0.1", a.port()).await.unwrap_err();
    assert!(matches!(err, EngineError::Handshake { .. }));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.count().await, 0);
    assert_eq!(b.count().await, 0);
    assert_eq!(a.engine.stats().snapshot().handshakes_rejected, 1);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_self_dial_rejected() {
    let a = TestNodeBuilder::new("a").build().await.unwrap();

    let err = a.engine.dial("127.0.0.1", a.port()).await.unwrap_err();
    assert!(matches!(err, EngineError::Handshake { .. }));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.count().await, 0);

    a.shutdown().await;
}

/// Two engines configured with the same identity: the acceptor sees its own id.
#[tokio::test]
async fn test_identity_clash_rejected() {
    let a = TestNodeBuilder::new("a").build().await.unwrap();
    let b = TestNodeBuilder::new("b")
        .peer_id(a.peer_id())
        .build()
        .await
        .unwrap();

    let err = b.engine.dial("127.0.0.1", a.port()).await.unwrap_err();
    match err {
        EngineError::Handshake { source, .. } => {
            assert!(!matches!(source, HandshakeError::Timeout), "got {source:?}");
        }
        other => panic!("expected handshake error, got {other:?}"),
    }
    assert_eq!(a.count().await, 0);

    b.shutdown().await;
    a.shutdown().await;
}

/// Shutting one side down drops the link on the other.
#[tokio::test]
async fn test_peer_shutdown_removes_connection() {
    let a = TestNodeBuilder::new("a").build().await.unwrap();
    let b = TestNodeBuilder::new("b").seed(&a).build().await.unwrap();

    b.engine.connect_to_seed_nodes().await;
    a.wait_connections(1, TIMEOUT).await.unwrap();
    let b_id = b.peer_id();

    b.shutdown().await;
    a.wait_connections(0, TIMEOUT).await.unwrap();
    // a clean close is not a strike
    assert!(!a.engine.registry().is_banned(&b_id));

    a.shutdown().await;
}
