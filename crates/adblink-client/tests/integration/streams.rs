//! Stream tests -- open/reject, both credit disciplines, reads and closes.

use std::sync::Arc;
use std::time::Duration;

use adblink_client::{AdbError, FlowControl, WriteCredit};
use adblink_protocol::{Command, Message, MAX_PAYLOAD};

use crate::harness::{connected, eventually, open_stream};

const SILENCE: Duration = Duration::from_millis(150);

/// OKAY(77) assigns the remote id; a later 4-byte OKAY adds credit.
#[tokio::test]
async fn test_okay_assigns_remote_id_and_credit() {
    let (conn, mut device) = connected(&["delayed_ack"], MAX_PAYLOAD).await;
    let stream = open_stream(&conn, &mut device, "shell:", 77, None).await;
    assert_eq!(stream.remote_id(), 77);
    assert_eq!(stream.write_credit(), WriteCredit::Bytes(0));

    device
        .send(Message::okay(77, stream.local_id(), Some(100)))
        .await;
    assert!(eventually(|| stream.write_credit() == WriteCredit::Bytes(100)).await);
}

#[tokio::test]
async fn test_legacy_okay_sets_ready() {
    let (conn, mut device) = connected(&[], MAX_PAYLOAD).await;
    let stream = open_stream(&conn, &mut device, "shell:", 77, None).await;
    assert_eq!(stream.remote_id(), 77);
    assert_eq!(stream.flow_control(), FlowControl::Legacy);
    assert_eq!(stream.write_credit(), WriteCredit::Ready(true));
}

/// A byte count on a legacy stream is a protocol violation and ends the
/// connection.
#[tokio::test]
async fn test_legacy_okay_with_payload_breaks_connection() {
    let (conn, mut device) = connected(&[], MAX_PAYLOAD).await;
    let stream = open_stream(&conn, &mut device, "shell:", 77, None).await;

    device
        .send(Message::okay(77, stream.local_id(), Some(100)))
        .await;
    assert!(eventually(|| stream.is_closed()).await);
    assert!(!conn.is_established());
    assert!(matches!(
        stream.write(b"x").await,
        Err(AdbError::StreamClosed)
    ));
    assert!(matches!(
        conn.open("shell:").await,
        Err(AdbError::ConnectionFailed(_))
    ));
}

#[tokio::test]
async fn test_okay_from_other_remote_breaks_connection() {
    let (conn, mut device) = connected(&["delayed_ack"], MAX_PAYLOAD).await;
    let stream = open_stream(&conn, &mut device, "shell:", 77, None).await;

    device
        .send(Message::okay(78, stream.local_id(), Some(1)))
        .await;
    assert!(eventually(|| stream.is_closed()).await);
    assert!(!conn.is_established());
}

#[tokio::test]
async fn test_bad_ack_length_breaks_connection() {
    let (conn, mut device) = connected(&["delayed_ack"], MAX_PAYLOAD).await;
    let stream = open_stream(&conn, &mut device, "shell:", 77, None).await;

    device
        .send(Message::new(Command::Okay, 77, stream.local_id(), &b"\x01\x02"[..]))
        .await;
    assert!(eventually(|| !conn.is_established()).await);
}

/// CLSE before OKAY rejects the open; later packets for that id are ignored.
#[tokio::test]
async fn test_open_rejected() {
    let (conn, mut device) = connected(&[], MAX_PAYLOAD).await;

    let script = async {
        let open = device.expect(Command::Open).await;
        device.send(Message::close(0, open.arg0)).await;
        open.arg0
    };
    let (result, rejected_id) = tokio::join!(conn.open("nonexistent:"), script);
    match result {
        Err(AdbError::StreamRejected { destination }) => assert_eq!(destination, "nonexistent:"),
        other => panic!("expected rejection, got {other:?}"),
    }

    device
        .send(Message::write(5, rejected_id, &b"stray"[..]))
        .await;
    device.send(Message::okay(5, rejected_id, None)).await;

    let stream = open_stream(&conn, &mut device, "shell:", 6, None).await;
    assert_eq!(stream.local_id(), rejected_id + 1);
    assert_eq!(stream.available(), 0);
    assert!(conn.is_established());
}

/// Legacy discipline: never two WRTEs in flight without an OKAY between.
#[tokio::test]
async fn test_legacy_single_write_in_flight() {
    let (conn, mut device) = connected(&[], 4096).await;
    let stream = Arc::new(open_stream(&conn, &mut device, "shell:", 9, None).await);
    let local = stream.local_id();

    let writer = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(&[0x61u8; 10_000]).await })
    };

    let mut sizes = Vec::new();
    for _ in 0..3 {
        let wrte = device.expect(Command::Wrte).await;
        assert_eq!((wrte.arg0, wrte.arg1), (local, 9));
        sizes.push(wrte.payload.len());
        device.assert_silent(SILENCE).await;
        device.send(Message::okay(9, local, None)).await;
    }
    assert_eq!(sizes, vec![4096, 4096, 1808]);
    writer.await.unwrap().unwrap();
}

/// Delayed-ack discipline: bytes sent never exceed bytes acknowledged.
#[tokio::test]
async fn test_delayed_ack_credit_accounting() {
    let (conn, mut device) = connected(&["delayed_ack"], 4096).await;
    let stream = Arc::new(open_stream(&conn, &mut device, "sync:", 9, Some(5000)).await);
    let local = stream.local_id();

    let writer = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(&[0x62u8; 12_000]).await })
    };

    assert_eq!(device.expect(Command::Wrte).await.payload.len(), 4096);
    assert_eq!(device.expect(Command::Wrte).await.payload.len(), 904);
    device.assert_silent(SILENCE).await;
    assert_eq!(stream.write_credit(), WriteCredit::Bytes(0));

    device.send(Message::okay(9, local, Some(8000))).await;
    assert_eq!(device.expect(Command::Wrte).await.payload.len(), 4096);
    assert_eq!(device.expect(Command::Wrte).await.payload.len(), 2904);
    writer.await.unwrap().unwrap();
    assert_eq!(stream.write_credit(), WriteCredit::Bytes(1000));
}

#[tokio::test]
async fn test_concurrent_writes_do_not_interleave() {
    let (conn, mut device) = connected(&["delayed_ack"], 4096).await;
    let stream = Arc::new(open_stream(&conn, &mut device, "shell:", 9, Some(1 << 20)).await);

    let a = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(&[b'a'; 10_000]).await })
    };
    let b = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(&[b'b'; 10_000]).await })
    };

    let mut received = Vec::new();
    while received.len() < 20_000 {
        received.extend_from_slice(&device.expect(Command::Wrte).await.payload);
    }
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let first = received[0];
    assert!(received[..10_000].iter().all(|c| *c == first));
    assert!(received[10_000..].iter().all(|c| *c != first));
}

#[tokio::test]
async fn test_read_acks_consumed_bytes() {
    let (conn, mut device) = connected(&["delayed_ack"], MAX_PAYLOAD).await;
    let stream = open_stream(&conn, &mut device, "shell:", 9, Some(0)).await;
    let local = stream.local_id();

    device
        .send(Message::write(9, local, &b"hello world"[..]))
        .await;
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello world");

    let okay = device.expect(Command::Okay).await;
    assert_eq!((okay.arg0, okay.arg1), (local, 9));
    assert_eq!(okay.acked_bytes().unwrap(), Some(11));
}

/// Partial reads return credit for what each call consumed.
#[tokio::test]
async fn test_partial_reads_ack_consumed_bytes() {
    let (conn, mut device) = connected(&["delayed_ack"], MAX_PAYLOAD).await;
    let stream = open_stream(&conn, &mut device, "shell:", 9, Some(0)).await;
    let local = stream.local_id();

    device
        .send(Message::write(9, local, &b"hello world"[..]))
        .await;
    let mut buf = [0u8; 4];
    let mut acked = Vec::new();
    let mut received = Vec::new();
    for _ in 0..3 {
        let n = stream.read(&mut buf).await.unwrap();
        received.extend_from_slice(&buf[..n]);
        let okay = device.expect(Command::Okay).await;
        acked.push(okay.acked_bytes().unwrap());
    }
    assert_eq!(received, b"hello world");
    assert_eq!(acked, vec![Some(4), Some(4), Some(3)]);
    device.assert_silent(SILENCE).await;
}

#[tokio::test]
async fn test_legacy_read_acks_with_empty_okay() {
    let (conn, mut device) = connected(&[], MAX_PAYLOAD).await;
    let stream = open_stream(&conn, &mut device, "shell:", 9, None).await;
    let local = stream.local_id();

    device.send(Message::write(9, local, &b"abcdef"[..])).await;
    let mut buf = [0u8; 4];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 4);
    assert_eq!(&buf, b"abcd");
    assert!(device.expect(Command::Okay).await.payload.is_empty());

    // The rest comes from the buffer without another ack.
    assert_eq!(stream.available(), 2);
    assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
    assert_eq!(&buf[..2], b"ef");
    device.assert_silent(SILENCE).await;
}

/// Peer CLSE with data queued: readable until drained, then end of stream.
#[tokio::test]
async fn test_pending_close_drains() {
    let (conn, mut device) = connected(&[], MAX_PAYLOAD).await;
    let stream = open_stream(&conn, &mut device, "shell:", 9, None).await;
    let local = stream.local_id();

    device.send(Message::write(9, local, &b"one"[..])).await;
    device.send(Message::write(9, local, &b"two"[..])).await;
    device.send(Message::close(9, local)).await;

    assert_eq!(stream.read_to_end().await.unwrap(), b"onetwo");
    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    assert!(stream.is_closed());
    assert!(matches!(stream.write(b"x").await, Err(AdbError::StreamClosed)));
    assert!(matches!(stream.flush().await, Err(AdbError::StreamClosed)));
}

#[tokio::test]
async fn test_local_close_is_idempotent() {
    let (conn, mut device) = connected(&[], MAX_PAYLOAD).await;
    let stream = open_stream(&conn, &mut device, "shell:", 77, None).await;
    let local = stream.local_id();

    stream.close().await.unwrap();
    let clse = device.expect(Command::Clse).await;
    assert_eq!((clse.arg0, clse.arg1), (local, 77));

    stream.close().await.unwrap();
    device.assert_silent(SILENCE).await;
    assert!(stream.is_closed());
    assert!(matches!(stream.write(b"x").await, Err(AdbError::StreamClosed)));

    device.send(Message::close(77, local)).await;
    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_connection_close_unblocks_streams() {
    let (conn, mut device) = connected(&[], MAX_PAYLOAD).await;
    let stream = Arc::new(open_stream(&conn, &mut device, "shell:", 9, None).await);

    let reader = {
        let stream = stream.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            stream.read(&mut buf).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.close().await;

    assert_eq!(reader.await.unwrap().unwrap(), 0);
    assert!(stream.is_closed());
    assert!(matches!(
        conn.open("shell:").await,
        Err(AdbError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_device_hangup_closes_streams() {
    let (conn, mut device) = connected(&["delayed_ack"], MAX_PAYLOAD).await;
    let stream = open_stream(&conn, &mut device, "shell:", 9, Some(0)).await;

    let writer = stream.write(b"blocked on credit");
    drop(device);
    assert!(matches!(writer.await, Err(AdbError::StreamClosed)));

    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    assert!(!conn.is_established());
}
