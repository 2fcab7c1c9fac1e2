//! Shared fixtures for unit tests.

use std::sync::Arc;

use gossipnet_protocol::PeerId;
use tokio::net::{TcpListener, TcpStream};

use crate::config::NodeConfig;
use crate::connection::{Connection, Direction};
use crate::Engine;

pub(crate) const TEST_NET: u8 = 1;
pub(crate) const TEST_PORT: u16 = 20000;

/// Two ends of a loopback TCP connection.
pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

/// A connection to `peer_id` announcing [`TEST_PORT`], plus the remote socket.
pub(crate) async fn test_connection(
    peer_id: PeerId,
    direction: Direction,
) -> (Arc<Connection>, TcpStream) {
    let (local, remote) = tcp_pair().await;
    let (conn, _read) = Connection::new(local, peer_id, TEST_PORT, direction, TEST_NET).unwrap();
    (conn, remote)
}

/// A free loopback port. The probe socket is closed before returning.
pub(crate) fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

pub(crate) fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.net_id = TEST_NET;
    config.network.listen_host = "127.0.0.1".into();
    config.network.port = free_port();
    config
}

pub(crate) fn test_engine() -> Engine {
    Engine::new(test_config()).unwrap()
}
