//! Pairing tests -- full exchange against a scripted pairing server.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::io::DuplexStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

use adblink_client::{PairingClient, PairingError, PairingState};
use adblink_crypto::tls::{TlsSession, PAIRING_EXPORT_LABEL, PAIRING_EXPORT_SIZE};
use adblink_crypto::{PairingAuth, PakeRole};
use adblink_protocol::pairing::{PEER_INFO_DEVICE_GUID, PEER_INFO_RSA_PUB_KEY};
use adblink_protocol::{PairingCodec, PairingPacket, PairingPacketType, PeerInfo};

use crate::harness::test_keys;

const DEVICE_GUID: &[u8] = b"adb-SERIAL123-abcdef";

fn acceptor() -> TlsAcceptor {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Device side of pairing. Returns the client's peer info if it decrypts
/// under `code`.
async fn pairing_server(io: DuplexStream, code: &str) -> Option<PeerInfo> {
    let tls = acceptor().accept(io).await.unwrap();
    let mut password = code.as_bytes().to_vec();
    password.extend(
        TlsSession::export_keying_material(tls.get_ref().1, PAIRING_EXPORT_LABEL, PAIRING_EXPORT_SIZE)
            .unwrap(),
    );
    let mut auth = PairingAuth::new(PakeRole::Server, &password).unwrap();
    let mut framed = Framed::new(tls, PairingCodec);

    let theirs = framed.next().await.unwrap().unwrap();
    assert_eq!(theirs.packet_type, PairingPacketType::Spake2Msg);
    framed
        .send(PairingPacket::new(
            PairingPacketType::Spake2Msg,
            auth.message().to_vec(),
        ))
        .await
        .unwrap();
    auth.init_cipher(&theirs.payload).unwrap();

    let theirs = framed.next().await.unwrap().unwrap();
    assert_eq!(theirs.packet_type, PairingPacketType::PeerInfo);
    let ours = PeerInfo::new(PEER_INFO_DEVICE_GUID, DEVICE_GUID).unwrap();
    let sealed = auth.encrypt(&ours.to_bytes()).unwrap();
    framed
        .send(PairingPacket::new(PairingPacketType::PeerInfo, sealed))
        .await
        .unwrap();

    let opened = auth.decrypt(&theirs.payload).ok()?;
    Some(PeerInfo::from_bytes(&opened).unwrap())
}

#[tokio::test]
async fn test_pairing_exchanges_peer_info() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let mut client = PairingClient::new("localhost", 0, "482913", test_keys(), "bench-host");

    let (result, client_info) = tokio::join!(
        client.pair_over(Box::new(client_io)),
        pairing_server(server_io, "482913")
    );
    let device = result.unwrap();
    assert_eq!(device.kind, PEER_INFO_DEVICE_GUID);
    assert_eq!(device.device_serial().as_deref(), Some("SERIAL123"));
    assert_eq!(client.state(), PairingState::Stopped);

    let client_info = client_info.expect("client peer info did not decrypt");
    assert_eq!(client_info.kind, PEER_INFO_RSA_PUB_KEY);
    assert!(client_info.text().contains("bench-host"));
}

#[tokio::test]
async fn test_wrong_code_is_reported() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let mut client = PairingClient::new("localhost", 0, "111111", test_keys(), "bench-host");

    let (result, client_info) = tokio::join!(
        client.pair_over(Box::new(client_io)),
        pairing_server(server_io, "222222")
    );
    assert!(matches!(result, Err(PairingError::WrongPairingCode)));
    assert!(client_info.is_none());
    assert_eq!(client.state(), PairingState::Stopped);
}
