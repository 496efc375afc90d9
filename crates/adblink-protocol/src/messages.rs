//! ADB packet types and constructors for every command the client sends.

use bytes::Bytes;
use std::fmt;

use crate::{A_STLS_VERSION, A_VERSION, INITIAL_DELAYED_ACK_BYTES, MAX_PAYLOAD};

// ============================================================================
// Commands
// ============================================================================

/// Four-character command codes packed little-endian into a u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Sync = 0x434e_5953,
    Cnxn = 0x4e58_4e43,
    Auth = 0x4854_5541,
    Open = 0x4e45_504f,
    Okay = 0x5941_4b4f,
    Clse = 0x4553_4c43,
    Wrte = 0x4554_5257,
    Stls = 0x534c_5453,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Sync,
        Command::Cnxn,
        Command::Auth,
        Command::Open,
        Command::Okay,
        Command::Clse,
        Command::Wrte,
        Command::Stls,
    ];

    pub fn from_u32(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_u32() == raw)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Value of the header's magic field for this command.
    pub fn magic(self) -> u32 {
        self.as_u32() ^ 0xFFFF_FFFF
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.as_u32().to_le_bytes();
        f.write_str(std::str::from_utf8(&bytes).map_err(|_| fmt::Error)?)
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// AUTH packet subtype, carried in arg0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    /// Random challenge from the daemon.
    Token = 1,
    /// Client's signature over the last token.
    Signature = 2,
    /// Client's public key, offered for user approval.
    RsaPublicKey = 3,
}

impl AuthType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(AuthType::Token),
            2 => Some(AuthType::Signature),
            3 => Some(AuthType::RsaPublicKey),
            _ => None,
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// One decoded ADB packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    /// CNXN carrying the host banner.
    pub fn connect(banner: &str) -> Self {
        Self::new(
            Command::Cnxn,
            A_VERSION,
            MAX_PAYLOAD,
            Bytes::copy_from_slice(banner.as_bytes()),
        )
    }

    pub fn auth(kind: AuthType, data: impl Into<Bytes>) -> Self {
        Self::new(Command::Auth, kind as u32, 0, data)
    }

    /// Acknowledgement of the daemon's STLS request.
    pub fn stls() -> Self {
        Self::new(Command::Stls, A_STLS_VERSION, 0, Bytes::new())
    }

    /// OPEN for `destination`. With delayed-ack the initial receive window
    /// rides in arg1.
    pub fn open(local_id: u32, destination: &str, delayed_ack: bool) -> Self {
        let mut payload = Vec::with_capacity(destination.len() + 1);
        payload.extend_from_slice(destination.as_bytes());
        payload.push(0);
        let window = if delayed_ack {
            INITIAL_DELAYED_ACK_BYTES
        } else {
            0
        };
        Self::new(Command::Open, local_id, window, payload)
    }

    /// OKAY from `local_id` to `remote_id`; `acked` is the byte count for
    /// delayed-ack streams.
    pub fn okay(local_id: u32, remote_id: u32, acked: Option<u32>) -> Self {
        let payload = match acked {
            Some(n) => Bytes::copy_from_slice(&n.to_le_bytes()),
            None => Bytes::new(),
        };
        Self::new(Command::Okay, local_id, remote_id, payload)
    }

    pub fn write(local_id: u32, remote_id: u32, data: impl Into<Bytes>) -> Self {
        Self::new(Command::Wrte, local_id, remote_id, data)
    }

    pub fn close(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Clse, local_id, remote_id, Bytes::new())
    }

    /// Acknowledged byte count carried by an OKAY. `None` for an empty
    /// payload; any length other than 0 or 4 is rejected.
    pub fn acked_bytes(&self) -> Result<Option<u32>, crate::ProtocolError> {
        match self.payload.len() {
            0 => Ok(None),
            4 => {
                let p = &self.payload;
                Ok(Some(u32::from_le_bytes([p[0], p[1], p[2], p[3]])))
            }
            n => Err(crate::ProtocolError::InvalidAckPayload(n)),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({:#x}, {:#x}, {} bytes)",
            self.command,
            self.arg0,
            self.arg1,
            self.payload.len()
        )
    }
}
