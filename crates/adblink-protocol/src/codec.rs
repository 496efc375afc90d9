//! ADB packet codec.
//!
//! Wire format: 24-byte little-endian header (command, arg0, arg1, length,
//! checksum, magic) followed by `length` payload bytes. The checksum is
//! always written but only verified below `A_VERSION_SKIP_CHECKSUM`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{Command, Message};
use crate::{ProtocolError, A_VERSION_MIN, A_VERSION_SKIP_CHECKSUM, MAX_PAYLOAD};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Unsigned byte sum of the payload.
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |acc, b| acc.wrapping_add(u32::from(*b)))
}

/// Codec for framing ADB messages over a byte stream.
///
/// Both limits change once CNXN has been exchanged: the protocol version
/// decides whether checksums are used, `max_data` bounds inbound payloads.
#[derive(Debug, Clone)]
pub struct AdbCodec {
    protocol_version: u32,
    max_data: u32,
}

impl AdbCodec {
    pub fn new() -> Self {
        Self::with_limits(A_VERSION_MIN, MAX_PAYLOAD)
    }

    pub fn with_limits(protocol_version: u32, max_data: u32) -> Self {
        Self {
            protocol_version,
            max_data,
        }
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn set_protocol_version(&mut self, version: u32) {
        self.protocol_version = version;
    }

    pub fn max_data(&self) -> u32 {
        self.max_data
    }

    pub fn set_max_data(&mut self, max_data: u32) {
        self.max_data = max_data;
    }

    pub fn checksums_enabled(&self) -> bool {
        self.protocol_version < A_VERSION_SKIP_CHECKSUM
    }

    /// Serialize one message into a fresh buffer.
    pub fn to_bytes(&self, msg: &Message) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + msg.payload.len());
        self.write_message(msg, &mut buf)?;
        Ok(buf)
    }

    fn write_message(&self, msg: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = msg.payload.len();
        if len > self.max_data as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: self.max_data as usize,
            });
        }

        dst.reserve(HEADER_SIZE + len);
        dst.put_u32_le(msg.command.as_u32());
        dst.put_u32_le(msg.arg0);
        dst.put_u32_le(msg.arg1);
        dst.put_u32_le(len as u32);
        dst.put_u32_le(checksum(&msg.payload));
        dst.put_u32_le(msg.command.magic());
        dst.extend_from_slice(&msg.payload);
        Ok(())
    }
}

impl Default for AdbCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn word(src: &[u8], index: usize) -> u32 {
    let at = index * 4;
    u32::from_le_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

impl Decoder for AdbCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let raw_command = word(src, 0);
        let arg0 = word(src, 1);
        let arg1 = word(src, 2);
        let length = word(src, 3) as usize;
        let check = word(src, 4);
        let magic = word(src, 5);

        if magic != raw_command ^ 0xFFFF_FFFF {
            return Err(ProtocolError::InvalidMagic {
                command: raw_command,
                got: magic,
            });
        }
        let command =
            Command::from_u32(raw_command).ok_or(ProtocolError::UnknownCommand(raw_command))?;

        if length > self.max_data as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: length,
                max: self.max_data as usize,
            });
        }

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        if self.checksums_enabled() {
            let actual = checksum(&payload);
            if actual != check {
                return Err(ProtocolError::ChecksumMismatch {
                    expected: check,
                    got: actual,
                });
            }
        }

        Ok(Some(Message {
            command,
            arg0,
            arg1,
            payload,
        }))
    }
}

impl Encoder<Message> for AdbCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.write_message(&item, dst)
    }
}
