//! The ZooKeeper driver reaches the configured servers over TCP.

#![cfg(feature = "zookeeper")]

use std::time::Duration;

use registry_center::{RegistryCenter, RegistryConfig, driver::ZooKeeperDriver};
use tokio::net::TcpListener;

#[tokio::test]
async fn test_init_dials_configured_server() {
    // Accepts connections but never answers the handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = tokio::spawn(async move { listener.accept().await.map(|(_, peer)| peer) });

    let config = RegistryConfig::new(addr.to_string(), "registry")
        .with_retry(50, 300, 1)
        .with_connection_timeout_ms(200);
    let center = RegistryCenter::new(config, ZooKeeperDriver::new());

    let err = center.init().await.unwrap_err();
    assert!(err.is_timeout());

    let peer = tokio::time::timeout(Duration::from_secs(2), accepted)
        .await
        .expect("no connection attempt reached the server")
        .unwrap();
    assert!(peer.is_ok());
}
