//! Integration tests for the connection pool over real TCP connections.

use std::sync::Arc;
use std::time::Duration;

use hsm_broker_core::pool::{tcp_factory, ConnectionPool};
use hsm_broker_core::testing::MockDevice;
use hsm_broker_core::BrokerError;

async fn start_device() -> (MockDevice, String) {
    let mut device = MockDevice::new("127.0.0.1:0");
    let address = device.start().await.unwrap();
    (device, address)
}

#[tokio::test]
async fn test_third_get_waits_for_put() {
    let (mut device, address) = start_device().await;
    let pool = Arc::new(ConnectionPool::new(
        2,
        tcp_factory(address, Duration::from_secs(1)),
    ));

    let first = pool.get().await.unwrap();
    let second = pool.get().await.unwrap();
    assert_eq!(pool.len(), 2);

    let third = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!third.is_finished());

    let reused_peer = first.peer_addr();
    pool.put(first).await;

    let third = tokio::time::timeout(Duration::from_secs(1), third)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(third.peer_addr(), reused_peer);
    assert_eq!(pool.len(), 2);

    // Both connections were created fresh; the third get reused one.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(device.connection_count(), 2);

    pool.put(second).await;
    pool.put(third).await;
    pool.close().await;
    device.stop().await;
}

#[tokio::test]
async fn test_get_after_close() {
    let (mut device, address) = start_device().await;
    let pool = ConnectionPool::new(2, tcp_factory(address, Duration::from_secs(1)));

    let conn = pool.get().await.unwrap();
    pool.put(conn).await;
    assert_eq!(pool.idle_len(), 1);

    pool.close().await;
    assert_eq!(pool.idle_len(), 0);
    assert_eq!(pool.len(), 0);
    assert!(matches!(pool.get().await, Err(BrokerError::PoolClosing)));

    device.stop().await;
}

#[tokio::test]
async fn test_connect_timeout_surfaces_from_factory() {
    // A non-routable address keeps the connect pending until the timeout.
    let pool = ConnectionPool::new(1, tcp_factory("10.255.255.1:1500", Duration::from_millis(50)));

    match pool.get().await {
        Err(BrokerError::ConnectTimeout { address }) => assert_eq!(address, "10.255.255.1:1500"),
        // Some sandboxes reject the route outright.
        Err(BrokerError::Connection(_)) => {}
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(pool.len(), 0);
}
