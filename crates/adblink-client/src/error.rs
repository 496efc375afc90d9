//! Error taxonomy for channels, connections, streams and pairing.

use adblink_crypto::CryptoError;
use adblink_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(std::io::Error),
    #[error("channel does not support tls")]
    TlsUnsupported,
    #[error("invalid tls server name: {0}")]
    InvalidServerName(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("usb error: {0}")]
    Usb(String),
    #[error("no usb device with an adb interface found")]
    NoUsbDevice,
}

impl TransportError {
    /// Whether a TLS-level failure looks like the daemon refusing a key it
    /// has never been paired with.
    pub fn indicates_pairing_required(&self) -> bool {
        let io = match self {
            TransportError::Tls(e) | TransportError::Io(e) => e,
            _ => return false,
        };
        if let Some(tls) = io
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            if matches!(tls, rustls::Error::AlertReceived(_)) {
                return true;
            }
        }
        io.to_string().to_ascii_lowercase().contains("protocol error")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("unexpected pairing packet: expected {expected}, got {got}")]
    UnexpectedPacket {
        expected: &'static str,
        got: &'static str,
    },
    #[error("peer closed the pairing connection")]
    PeerClosed,
    #[error("pairing client already used")]
    AlreadyUsed,
    #[error("peer info could not be decrypted, check the pairing code")]
    WrongPairingCode,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("authentication failed: the device did not accept this key")]
    AuthenticationFailed,
    #[error("pairing required: the device refused the tls handshake")]
    PairingRequired,
    #[error("stream closed")]
    StreamClosed,
    #[error("stream rejected by peer: {destination}")]
    StreamRejected { destination: String },
    #[error("not connected")]
    NotConnected,
    #[error("connection already started")]
    AlreadyConnected,
    #[error("timed out waiting for the device")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("pairing failed: {0}")]
    Pairing(#[from] PairingError),
}
