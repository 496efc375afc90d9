//! Test harness for in-process adblink-client integration tests.
//!
//! Provides FakeDevice (a scripted adbd on the far end of a duplex pipe)
//! and helpers that hand back a connection already past CNXN.
//!
//! FakeDevice reads exactly one packet at a time so the pipe can be handed
//! to a TLS acceptor mid-conversation without losing buffered bytes.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Decoder;

use adblink_client::{AdbConnection, AdbStream, ConnectionOptions, TcpChannel};
use adblink_crypto::AdbKeyPair;
use adblink_protocol::codec::HEADER_SIZE;
use adblink_protocol::{AdbCodec, Command, Message, A_VERSION, MAX_PAYLOAD};

/// Upper bound for any single step of a scripted exchange.
pub const STEP: Duration = Duration::from_secs(5);

/// Key pair shared by every test in the binary. RSA generation is slow.
pub fn test_keys() -> Arc<AdbKeyPair> {
    static KEYS: OnceLock<Arc<AdbKeyPair>> = OnceLock::new();
    KEYS.get_or_init(|| Arc::new(AdbKeyPair::generate().unwrap()))
        .clone()
}

/// Scripted daemon side of a connection.
pub struct FakeDevice<IO = DuplexStream> {
    io: IO,
    codec: AdbCodec,
}

#[allow(dead_code)]
impl<IO: AsyncRead + AsyncWrite + Unpin> FakeDevice<IO> {
    pub fn new(io: IO) -> Self {
        Self {
            io,
            codec: AdbCodec::new(),
        }
    }

    pub fn into_inner(self) -> IO {
        self.io
    }

    async fn read_packet(&mut self) -> std::io::Result<Message> {
        let mut header = [0u8; HEADER_SIZE];
        self.io.read_exact(&mut header).await?;
        let length = u32::from_le_bytes([header[12], header[13], header[14], header[15]]) as usize;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + length);
        buf.extend_from_slice(&header);
        buf.resize(HEADER_SIZE + length, 0);
        self.io.read_exact(&mut buf[HEADER_SIZE..]).await?;

        self.codec
            .decode(&mut buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
    }

    /// Next packet from the client. Panics on timeout or hang-up.
    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(STEP, self.read_packet())
            .await
            .expect("timed out waiting for a packet")
            .expect("client hung up")
    }

    pub async fn expect(&mut self, command: Command) -> Message {
        let msg = self.recv().await;
        assert_eq!(msg.command, command, "unexpected packet {msg}");
        msg
    }

    /// Assert the client sends nothing for `window`. A hang-up also counts
    /// as silence.
    pub async fn assert_silent(&mut self, window: Duration) {
        if let Ok(Ok(msg)) = tokio::time::timeout(window, self.read_packet()).await {
            panic!("expected silence, got {msg}");
        }
    }

    pub async fn send(&mut self, msg: Message) {
        let packet = self.codec.to_bytes(&msg).unwrap();
        self.io.write_all(&packet).await.unwrap();
        self.io.flush().await.unwrap();
    }

    /// Send `msg` with a zero checksum field, as a daemon past
    /// `A_VERSION_SKIP_CHECKSUM` does.
    pub async fn send_unchecked(&mut self, msg: Message) {
        let mut packet = self.codec.to_bytes(&msg).unwrap();
        packet[16..20].fill(0);
        self.io.write_all(&packet).await.unwrap();
        self.io.flush().await.unwrap();
    }

    /// Answer the client's CNXN with our own.
    pub async fn accept(&mut self, features: &[&str]) -> Message {
        self.accept_with(features, MAX_PAYLOAD).await
    }

    pub async fn accept_with(&mut self, features: &[&str], max_data: u32) -> Message {
        let cnxn = self.expect(Command::Cnxn).await;
        self.send_banner(features, max_data).await;
        cnxn
    }

    pub async fn send_banner(&mut self, features: &[&str], max_data: u32) {
        let banner = format!(
            "device::ro.product.name=fake;ro.product.model=Fake Device;features={}",
            features.join(",")
        );
        self.send(Message::new(Command::Cnxn, A_VERSION, max_data, banner.into_bytes()))
            .await;
        self.codec.set_protocol_version(A_VERSION);
    }

    /// Expect an OPEN and accept it as `remote_id`.
    pub async fn accept_open(&mut self, remote_id: u32, acked: Option<u32>) -> Message {
        let open = self.expect(Command::Open).await;
        self.send(Message::okay(remote_id, open.arg0, acked)).await;
        open
    }
}

/// A connection over a duplex pipe with the device end returned unscripted.
pub fn device_pair(options: ConnectionOptions) -> (AdbConnection, FakeDevice) {
    let (client, device) = tokio::io::duplex(4 * 1024 * 1024);
    let channel = TcpChannel::from_io("localhost", Box::new(client));
    let conn = AdbConnection::new(Box::new(channel), test_keys(), options);
    (conn, FakeDevice::new(device))
}

/// A connection that has completed CNXN with a device advertising `features`.
pub async fn connected(features: &[&str], max_data: u32) -> (Arc<AdbConnection>, FakeDevice) {
    let (conn, mut device) = device_pair(ConnectionOptions::default());
    let (result, _) = tokio::join!(
        conn.connect(Some(STEP), false),
        device.accept_with(features, max_data)
    );
    assert!(result.unwrap(), "handshake did not complete");
    (Arc::new(conn), device)
}

/// Open `destination` while the device accepts it as `remote_id`.
pub async fn open_stream(
    conn: &AdbConnection,
    device: &mut FakeDevice,
    destination: &str,
    remote_id: u32,
    acked: Option<u32>,
) -> AdbStream {
    let (stream, _) = tokio::join!(
        conn.open(destination),
        device.accept_open(remote_id, acked)
    );
    stream.unwrap()
}

/// Poll `check` until it holds or `STEP` elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + STEP;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
