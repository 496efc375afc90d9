//! Transport channels -- the byte pipe under one ADB connection.
//!
//! `TcpChannel` speaks plain TCP and can be upgraded in place to TLS when
//! the daemon sends STLS. `UsbChannel` talks to the ADB bulk interface.
//! Channels are single-use: once closed or failed they never reconnect.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use adblink_crypto::AdbKeyPair;

use crate::error::TransportError;

pub mod tcp;
pub mod usb;

pub use tcp::TcpChannel;
pub use usb::{UsbChannel, UsbDeviceSummary};

/// Any duplex byte stream a channel can sit on.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

pub type BoxedIo = Box<dyn AsyncIo>;

#[async_trait]
pub trait Channel: Send + Sync {
    /// Write one complete encoded packet (header followed by payload).
    async fn write(&self, packet: &[u8]) -> Result<(), TransportError>;

    async fn flush(&self) -> Result<(), TransportError>;

    /// Read whatever is available. `Ok(0)` means nothing arrived this call;
    /// end of stream is `TransportError::Closed`.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Shut the channel down, unblocking pending reads and writes.
    async fn close(&self);

    fn is_connected(&self) -> bool;

    /// Replace the plaintext path with a TLS session authenticated by `keys`.
    async fn upgrade_to_tls(&self, _keys: &AdbKeyPair) -> Result<(), TransportError> {
        Err(TransportError::TlsUnsupported)
    }

    fn is_tls(&self) -> bool {
        false
    }

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}
