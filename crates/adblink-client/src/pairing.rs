//! Pairing engine -- trusts our key on a device using its pairing code.
//!
//! One short-lived TLS connection per attempt:
//!   1. TLS 1.3 handshake presenting our certificate.
//!   2. Export 64 bytes of keying material; the SPAKE2 password is the
//!      pairing code followed by that material.
//!   3. Swap SPAKE2 messages in the clear and derive the AES-GCM key.
//!   4. Swap encrypted `PeerInfo` records. Ours carries the public key.
//!
//! The password is zeroized when the attempt ends, successful or not.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use zeroize::{Zeroize, Zeroizing};

use adblink_crypto::tls::{self, TlsSession, PAIRING_EXPORT_LABEL, PAIRING_EXPORT_SIZE};
use adblink_crypto::{AdbKeyPair, PairingAuth, PakeRole};
use adblink_protocol::pairing::PEER_INFO_RSA_PUB_KEY;
use adblink_protocol::{PairingCodec, PairingPacket, PairingPacketType, PeerInfo};

use crate::error::{PairingError, TransportError};
use crate::transport::BoxedIo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Ready,
    ExchangingMsgs,
    ExchangingPeerInfo,
    Stopped,
}

pub struct PairingClient {
    host: String,
    port: u16,
    keys: Arc<AdbKeyPair>,
    device_name: String,
    password: Zeroizing<Vec<u8>>,
    state: PairingState,
}

fn packet_name(kind: PairingPacketType) -> &'static str {
    match kind {
        PairingPacketType::Spake2Msg => "SPAKE2_MSG",
        PairingPacketType::PeerInfo => "PEER_INFO",
    }
}

impl PairingClient {
    /// `code` is the six-digit code shown on the device. An empty
    /// `device_name` uses the key name.
    pub fn new(host: &str, port: u16, code: &str, keys: Arc<AdbKeyPair>, device_name: &str) -> Self {
        let device_name = if device_name.is_empty() {
            keys.key_name().to_string()
        } else {
            device_name.to_string()
        };
        Self {
            host: host.to_string(),
            port,
            keys,
            device_name,
            password: Zeroizing::new(code.trim().as_bytes().to_vec()),
            state: PairingState::Ready,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    fn transition(&mut self, next: PairingState) {
        tracing::debug!(host = %self.host, from = ?self.state, to = ?next, "pairing state");
        self.state = next;
    }

    /// Dial the pairing port and run the exchange. Returns the device's
    /// peer info.
    pub async fn pair(&mut self) -> Result<PeerInfo, PairingError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(TransportError::from)?;
        stream.set_nodelay(true).map_err(TransportError::from)?;
        self.pair_over(Box::new(stream)).await
    }

    /// Run the exchange over an already connected stream.
    pub async fn pair_over(&mut self, io: BoxedIo) -> Result<PeerInfo, PairingError> {
        if self.state != PairingState::Ready {
            return Err(PairingError::AlreadyUsed);
        }
        let result = self.exchange(io).await;
        self.transition(PairingState::Stopped);
        self.password.zeroize();

        match &result {
            Ok(peer) => tracing::info!(
                host = %self.host,
                serial = peer.device_serial().as_deref().unwrap_or("unknown"),
                "pairing complete"
            ),
            Err(e) => tracing::warn!(host = %self.host, "pairing failed: {e}"),
        }
        result
    }

    async fn exchange(&mut self, io: BoxedIo) -> Result<PeerInfo, PairingError> {
        let config = tls::build_client_config(&self.keys)?;
        let server_name = rustls::pki_types::ServerName::try_from(self.host.clone())
            .map_err(|_| TransportError::InvalidServerName(self.host.clone()))?;
        let tls_stream = TlsConnector::from(config)
            .connect(server_name, io)
            .await
            .map_err(TransportError::Tls)?;

        let mut password = Zeroizing::new(self.password.to_vec());
        let exported = Zeroizing::new(TlsSession::export_keying_material(
            tls_stream.get_ref().1,
            PAIRING_EXPORT_LABEL,
            PAIRING_EXPORT_SIZE,
        )?);
        password.extend_from_slice(&exported);

        let mut auth = PairingAuth::new(PakeRole::Client, &password)?;
        let mut framed = Framed::new(tls_stream, PairingCodec);

        self.transition(PairingState::ExchangingMsgs);
        framed
            .send(PairingPacket::new(
                PairingPacketType::Spake2Msg,
                auth.message().to_vec(),
            ))
            .await?;
        let theirs = expect_packet(&mut framed, PairingPacketType::Spake2Msg).await?;
        auth.init_cipher(&theirs.payload)?;

        self.transition(PairingState::ExchangingPeerInfo);
        let public_key = self.keys.android_public_key_named(&self.device_name)?;
        let ours = PeerInfo::new(PEER_INFO_RSA_PUB_KEY, &public_key)?;
        let sealed = auth.encrypt(&ours.to_bytes())?;
        framed
            .send(PairingPacket::new(PairingPacketType::PeerInfo, sealed))
            .await?;

        let theirs = expect_packet(&mut framed, PairingPacketType::PeerInfo).await?;
        let opened = auth
            .decrypt(&theirs.payload)
            .map_err(|_| PairingError::WrongPairingCode)?;
        let peer = PeerInfo::from_bytes(&opened)?;
        tracing::debug!(kind = peer.kind, "received peer info");
        Ok(peer)
    }
}

async fn expect_packet<T>(
    framed: &mut Framed<T, PairingCodec>,
    expected: PairingPacketType,
) -> Result<PairingPacket, PairingError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let packet = framed.next().await.ok_or(PairingError::PeerClosed)??;
    if packet.packet_type != expected {
        return Err(PairingError::UnexpectedPacket {
            expected: packet_name(expected),
            got: packet_name(packet.packet_type),
        });
    }
    Ok(packet)
}
