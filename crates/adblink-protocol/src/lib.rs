//! adblink Protocol -- ADB wire types, packet codec, pairing framing.
//!
//! ADB packets: 24-byte little-endian header + payload, checksummed on
//! protocol versions below `A_VERSION_SKIP_CHECKSUM`.
//! Pairing packets: 6-byte header with big-endian size, inside TLS.

pub mod banner;
pub mod codec;
pub mod messages;
pub mod pairing;
pub mod services;

pub use banner::{ConnectBanner, FEATURE_DELAYED_ACK};
pub use codec::AdbCodec;
pub use messages::{AuthType, Command, Message};
pub use pairing::{PairingCodec, PairingPacket, PairingPacketType, PeerInfo};
pub use services::Service;

/// Oldest protocol version; header carries a payload checksum.
pub const A_VERSION_MIN: u32 = 0x0100_0000;

/// First version where the payload checksum is skipped.
pub const A_VERSION_SKIP_CHECKSUM: u32 = 0x0100_0001;

/// Version the client announces in CNXN.
pub const A_VERSION: u32 = 0x0100_0001;

/// Version carried in the STLS acknowledgement.
pub const A_STLS_VERSION: u32 = 0x0100_0000;

/// Maximum payload of pre-1.0.32 daemons.
pub const MAX_PAYLOAD_V1: u32 = 4 * 1024;

/// Maximum payload the client accepts and announces.
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

/// Receive window announced in OPEN when delayed acks are negotiated.
pub const INITIAL_DELAYED_ACK_BYTES: u32 = 32 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid magic for command {command:#010x}: got {got:#010x}")]
    InvalidMagic { command: u32, got: u32 },
    #[error("unknown command: {0:#010x}")]
    UnknownCommand(u32),
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("checksum mismatch: header says {expected:#010x}, payload sums to {got:#010x}")]
    ChecksumMismatch { expected: u32, got: u32 },
    #[error("invalid OKAY payload length: {0} bytes")]
    InvalidAckPayload(usize),
    #[error("unsupported pairing packet version: {0}")]
    UnsupportedPairingVersion(u8),
    #[error("unknown pairing packet type: {0}")]
    UnknownPairingType(u8),
    #[error("invalid pairing payload size: {0}")]
    InvalidPairingSize(u32),
    #[error("invalid peer info: {0}")]
    InvalidPeerInfo(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
