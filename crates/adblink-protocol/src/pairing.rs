//! Pairing wire format, spoken inside the pairing TLS session.
//!
//! Header: version (u8), type (u8), payload size (u32 big-endian).
//! Peer info: one type byte plus a zero-padded data area, 8192 bytes total.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use tokio_util::codec::{Decoder, Encoder};

use crate::ProtocolError;

pub const PAIRING_HEADER_SIZE: usize = 6;

pub const PAIRING_VERSION_MIN: u8 = 1;
pub const PAIRING_VERSION_MAX: u8 = 1;
pub const PAIRING_VERSION: u8 = PAIRING_VERSION_MAX;

/// Fixed size of an encoded peer info record.
pub const MAX_PEER_INFO_SIZE: usize = 8192;

/// Largest payload a pairing packet may carry.
pub const MAX_PAIRING_PAYLOAD: usize = 2 * MAX_PEER_INFO_SIZE;

/// Peer info carrying an Android-encoded RSA public key.
pub const PEER_INFO_RSA_PUB_KEY: u8 = 0;
/// Peer info carrying the device GUID.
pub const PEER_INFO_DEVICE_GUID: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PairingPacketType {
    Spake2Msg = 0,
    PeerInfo = 1,
}

impl PairingPacketType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Spake2Msg),
            1 => Some(Self::PeerInfo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingHeader {
    pub version: u8,
    pub packet_type: PairingPacketType,
    pub payload_size: u32,
}

impl PairingHeader {
    pub fn new(packet_type: PairingPacketType, payload_size: u32) -> Self {
        Self {
            version: PAIRING_VERSION,
            packet_type,
            payload_size,
        }
    }

    pub fn parse(bytes: &[u8; PAIRING_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let version = bytes[0];
        if !(PAIRING_VERSION_MIN..=PAIRING_VERSION_MAX).contains(&version) {
            return Err(ProtocolError::UnsupportedPairingVersion(version));
        }
        let packet_type =
            PairingPacketType::from_u8(bytes[1]).ok_or(ProtocolError::UnknownPairingType(bytes[1]))?;
        let payload_size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        if payload_size == 0 || payload_size as usize > MAX_PAIRING_PAYLOAD {
            return Err(ProtocolError::InvalidPairingSize(payload_size));
        }
        Ok(Self {
            version,
            packet_type,
            payload_size,
        })
    }

    pub fn to_bytes(&self) -> [u8; PAIRING_HEADER_SIZE] {
        let size = self.payload_size.to_be_bytes();
        [
            self.version,
            self.packet_type as u8,
            size[0],
            size[1],
            size[2],
            size[3],
        ]
    }
}

/// One framed pairing packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingPacket {
    pub packet_type: PairingPacketType,
    pub payload: Bytes,
}

impl PairingPacket {
    pub fn new(packet_type: PairingPacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }
}

/// Codec for pairing packets.
#[derive(Debug, Default, Clone, Copy)]
pub struct PairingCodec;

impl Decoder for PairingCodec {
    type Item = PairingPacket;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PAIRING_HEADER_SIZE {
            return Ok(None);
        }

        let mut raw = [0u8; PAIRING_HEADER_SIZE];
        raw.copy_from_slice(&src[..PAIRING_HEADER_SIZE]);
        let header = PairingHeader::parse(&raw)?;

        let total = PAIRING_HEADER_SIZE + header.payload_size as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(PAIRING_HEADER_SIZE);
        let payload = src.split_to(header.payload_size as usize).freeze();
        Ok(Some(PairingPacket {
            packet_type: header.packet_type,
            payload,
        }))
    }
}

impl Encoder<PairingPacket> for PairingCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: PairingPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.payload.len();
        if size == 0 || size > MAX_PAIRING_PAYLOAD {
            return Err(ProtocolError::InvalidPairingSize(size as u32));
        }
        let header = PairingHeader::new(item.packet_type, size as u32);
        dst.reserve(PAIRING_HEADER_SIZE + size);
        dst.put_slice(&header.to_bytes());
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

/// Identity record exchanged (encrypted) at the end of pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub kind: u8,
    data: Vec<u8>,
}

impl PeerInfo {
    /// Room for data after the type byte.
    pub const DATA_SIZE: usize = MAX_PEER_INFO_SIZE - 1;

    pub fn new(kind: u8, data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > Self::DATA_SIZE {
            return Err(ProtocolError::InvalidPeerInfo(format!(
                "{} bytes of data exceeds {}",
                data.len(),
                Self::DATA_SIZE
            )));
        }
        Ok(Self {
            kind,
            data: data.to_vec(),
        })
    }

    /// Decode a record; anything but exactly `MAX_PEER_INFO_SIZE` bytes is rejected.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.len() != MAX_PEER_INFO_SIZE {
            return Err(ProtocolError::InvalidPeerInfo(format!(
                "expected {MAX_PEER_INFO_SIZE} bytes, got {}",
                raw.len()
            )));
        }
        let body = &raw[1..];
        let end = body.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        Ok(Self {
            kind: raw[0],
            data: body[..end].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; MAX_PEER_INFO_SIZE];
        out[0] = self.kind;
        out[1..1 + self.data.len()].copy_from_slice(&self.data);
        out
    }

    /// Data with trailing padding removed.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Serial from a GUID of the form `adb-<serial>-<suffix>`.
    pub fn device_serial(&self) -> Option<String> {
        let text = self.text();
        let rest = text.trim_end_matches('\0').strip_prefix("adb-")?;
        let (serial, _suffix) = rest.rsplit_once('-')?;
        (!serial.is_empty()).then(|| serial.to_string())
    }
}
