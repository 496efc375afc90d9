//! Manager tests -- one active connection, opened and torn down by the manager.

use std::sync::Arc;

use adblink_client::{AdbError, ConnectionManager, ConnectionOptions, Phase, TcpChannel};
use adblink_crypto::MemoryKeyProvider;
use adblink_protocol::MAX_PAYLOAD;

use crate::harness::{test_keys, FakeDevice};

fn manager() -> ConnectionManager {
    let keys = Arc::new(MemoryKeyProvider::new(test_keys()));
    ConnectionManager::new(keys, ConnectionOptions::default(), "adblink-test")
}

#[tokio::test]
async fn test_connect_open_disconnect() {
    let manager = manager();
    let (client, device) = tokio::io::duplex(1024 * 1024);
    let mut device = FakeDevice::new(device);
    let channel = TcpChannel::from_io("localhost", Box::new(client));

    let (conn, _) = tokio::join!(
        manager.connect_with(Box::new(channel)),
        device.accept_with(&["shell_v2"], MAX_PAYLOAD)
    );
    let conn = conn.unwrap();
    assert!(manager.current().await.is_some());

    let (stream, open) = tokio::join!(manager.open("shell:"), device.accept_open(12, None));
    let stream = stream.unwrap();
    assert_eq!(stream.remote_id(), 12);
    assert_eq!(&open.payload[..], b"shell:\0");

    manager.disconnect().await;
    assert!(manager.current().await.is_none());
    assert_eq!(conn.phase(), Phase::Closed);
    assert!(stream.is_closed());
    assert!(matches!(
        manager.open("shell:").await,
        Err(AdbError::NotConnected)
    ));
}

#[tokio::test]
async fn test_open_without_connection() {
    let manager = manager();
    assert!(matches!(
        manager.open("shell:").await,
        Err(AdbError::NotConnected)
    ));
}
