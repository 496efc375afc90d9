//! Handshake tests -- CNXN negotiation, AUTH fallbacks, timeouts.

use std::time::Duration;

use adblink_client::{AdbError, ConnectionOptions, FlowControl, Phase};
use adblink_protocol::{
    AuthType, Command, Message, A_VERSION, INITIAL_DELAYED_ACK_BYTES, MAX_PAYLOAD,
};

use crate::harness::{connected, device_pair, open_stream, test_keys, STEP};

fn token() -> Message {
    Message::auth(AuthType::Token, vec![0x5au8; 20])
}

/// Device advertising delayed_ack gets byte-credit streams.
#[tokio::test]
async fn test_delayed_ack_negotiated() {
    let (conn, mut device) = connected(&["shell_v2", "cmd", "delayed_ack"], MAX_PAYLOAD).await;

    assert!(conn.has_feature("delayed_ack").await.unwrap());
    assert!(conn.has_feature("shell_v2").await.unwrap());
    assert!(!conn.has_feature("abb_exec").await.unwrap());
    assert!(conn.is_delayed_ack_enabled().await.unwrap());
    assert_eq!(conn.max_data().await.unwrap(), MAX_PAYLOAD);

    let (stream, open) = tokio::join!(conn.open("shell:"), device.accept_open(77, Some(0)));
    let stream = stream.unwrap();
    assert_eq!(stream.flow_control(), FlowControl::DelayedAck);
    assert_eq!(open.arg1, INITIAL_DELAYED_ACK_BYTES);
    assert_eq!(&open.payload[..], b"shell:\0");
}

#[tokio::test]
async fn test_host_banner_advertises_delayed_ack() {
    let (conn, mut device) = device_pair(ConnectionOptions::default());
    let (result, cnxn) = tokio::join!(conn.connect(Some(STEP), false), device.accept(&[]));
    assert!(result.unwrap());

    let banner = String::from_utf8(cnxn.payload.to_vec()).unwrap();
    assert!(banner.starts_with("host::features="));
    assert!(banner.contains("delayed_ack"));
    assert_eq!(cnxn.arg1, MAX_PAYLOAD);

    // The device did not offer it, so streams stay on legacy credit.
    assert!(!conn.is_delayed_ack_enabled().await.unwrap());
    let stream = open_stream(&conn, &mut device, "shell:", 3, None).await;
    assert_eq!(stream.flow_control(), FlowControl::Legacy);
}

#[tokio::test]
async fn test_delayed_ack_disabled_locally() {
    let options = ConnectionOptions {
        enable_delayed_ack: false,
        ..ConnectionOptions::default()
    };
    let (conn, mut device) = device_pair(options);
    let (result, cnxn) = tokio::join!(
        conn.connect(Some(STEP), false),
        device.accept(&["delayed_ack"])
    );
    assert!(result.unwrap());
    assert!(!String::from_utf8_lossy(&cnxn.payload).contains("delayed_ack"));
    assert!(conn.has_feature("delayed_ack").await.unwrap());
    assert!(!conn.is_delayed_ack_enabled().await.unwrap());
}

/// A second AUTH challenge with abort requested fails connect and gets no
/// third reply.
#[tokio::test]
async fn test_second_challenge_aborts() {
    let (conn, mut device) = device_pair(ConnectionOptions::default());

    let script = async move {
        device.expect(Command::Cnxn).await;
        device.send(token()).await;
        let reply = device.expect(Command::Auth).await;
        assert_eq!(reply.arg0, AuthType::Signature as u32);
        assert_eq!(reply.payload.len(), 256);
        device.send(token()).await;
        device
    };
    let (result, mut device) = tokio::join!(conn.connect(Some(STEP), true), script);

    assert!(matches!(result, Err(AdbError::AuthenticationFailed)));
    device.assert_silent(Duration::from_millis(200)).await;
    assert_eq!(conn.phase(), Phase::Closed);
}

#[tokio::test]
async fn test_second_challenge_sends_public_key() {
    let (conn, mut device) = device_pair(ConnectionOptions::default());

    let script = async {
        device.expect(Command::Cnxn).await;
        device.send(token()).await;
        let signature = device.expect(Command::Auth).await;
        assert_eq!(signature.arg0, AuthType::Signature as u32);

        device.send(token()).await;
        let public_key = device.expect(Command::Auth).await;
        assert_eq!(public_key.arg0, AuthType::RsaPublicKey as u32);
        let text = String::from_utf8(public_key.payload.to_vec()).unwrap();
        assert!(text.ends_with('\0'));
        assert!(text.contains(test_keys().key_name()));

        device.send_banner(&[], MAX_PAYLOAD).await;
    };
    let (result, _) = tokio::join!(conn.connect(Some(STEP), false), script);
    assert!(result.unwrap());
    assert!(conn.is_established());
}

/// AUTH and CNXN from a current daemon carry no checksum.
#[tokio::test]
async fn test_handshake_accepts_zero_checksums() {
    let (conn, mut device) = device_pair(ConnectionOptions::default());
    let script = async {
        device.expect(Command::Cnxn).await;
        device.send_unchecked(token()).await;
        let signature = device.expect(Command::Auth).await;
        assert_eq!(signature.arg0, AuthType::Signature as u32);

        let banner = b"device::ro.product.model=Fake Device;features=shell_v2".to_vec();
        device
            .send_unchecked(Message::new(Command::Cnxn, A_VERSION, MAX_PAYLOAD, banner))
            .await;
    };
    let (result, _) = tokio::join!(conn.connect(Some(STEP), false), script);
    assert!(result.unwrap());
    assert!(conn.has_feature("shell_v2").await.unwrap());
    assert_eq!(conn.protocol_version().await.unwrap(), A_VERSION);
}

#[tokio::test]
async fn test_abort_option_applies_without_flag() {
    let options = ConnectionOptions {
        abort_on_unauthorised: true,
        ..ConnectionOptions::default()
    };
    let (conn, mut device) = device_pair(options);
    let script = async {
        device.expect(Command::Cnxn).await;
        device.send(token()).await;
        device.expect(Command::Auth).await;
        device.send(token()).await;
    };
    let (result, _) = tokio::join!(conn.connect(Some(STEP), false), script);
    assert!(matches!(result, Err(AdbError::AuthenticationFailed)));
}

/// A timed-out connect keeps the handshake alive for a late device.
#[tokio::test]
async fn test_connect_timeout_then_late_accept() {
    let (conn, mut device) = device_pair(ConnectionOptions::default());

    let result = conn.connect(Some(Duration::from_millis(100)), false).await;
    assert!(!result.unwrap());
    assert_eq!(conn.phase(), Phase::Connecting);

    device.accept(&[]).await;
    assert!(conn.wait_for_connection(Some(STEP)).await.unwrap());
    assert_eq!(conn.protocol_version().await.unwrap(), A_VERSION);
}

#[tokio::test]
async fn test_connect_twice_rejected() {
    let (conn, _device) = connected(&[], MAX_PAYLOAD).await;
    assert!(matches!(
        conn.connect(Some(STEP), false).await,
        Err(AdbError::AlreadyConnected)
    ));
}

#[tokio::test]
async fn test_accessors_before_connect() {
    let (conn, _device) = device_pair(ConnectionOptions::default());
    assert!(matches!(conn.max_data().await, Err(AdbError::NotConnected)));
    assert!(matches!(conn.open("shell:").await, Err(AdbError::NotConnected)));
}

#[tokio::test]
async fn test_device_hangup_fails_connect() {
    let (conn, mut device) = device_pair(ConnectionOptions::default());
    let script = async move {
        device.expect(Command::Cnxn).await;
        drop(device);
    };
    let (result, _) = tokio::join!(conn.connect(Some(STEP), false), script);
    assert!(matches!(result, Err(AdbError::ConnectionFailed(_))));
    assert_eq!(conn.phase(), Phase::Closed);
}

#[tokio::test]
async fn test_stream_packets_before_cnxn_ignored() {
    let (conn, mut device) = device_pair(ConnectionOptions::default());
    let script = async {
        device.expect(Command::Cnxn).await;
        device.send(Message::okay(9, 1, None)).await;
        device.send(Message::write(9, 1, &b"early"[..])).await;
        device.send(Message::close(9, 1)).await;
        device.send_banner(&[], MAX_PAYLOAD).await;
    };
    let (result, _) = tokio::join!(conn.connect(Some(STEP), false), script);
    assert!(result.unwrap());

    let stream = open_stream(&conn, &mut device, "shell:", 9, None).await;
    assert_eq!(stream.local_id(), 1);
    assert_eq!(stream.available(), 0);
}

#[tokio::test]
async fn test_inbound_open_ignored() {
    let (conn, mut device) = connected(&[], MAX_PAYLOAD).await;
    device
        .send(Message::new(Command::Open, 4, 0, &b"reverse:\0"[..]))
        .await;
    device.assert_silent(Duration::from_millis(100)).await;

    let stream = open_stream(&conn, &mut device, "shell:", 5, None).await;
    assert_eq!(stream.remote_id(), 5);
}
