//! TLS configuration for the STLS upgrade and the pairing channel.
//!
//! Self-signed X.509 certificates from the RSA key pair via rcgen.
//! Client skips server chain verification (the daemon's identity is not
//! pinned; our own certificate is what the daemon checks).

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use std::time::Duration;

use crate::keys::AdbKeyPair;
use crate::CryptoError;

/// Label for the keying material that binds pairing to the TLS session.
pub const PAIRING_EXPORT_LABEL: &[u8] = b"adb-label\0";

/// Bytes of keying material exported for pairing.
pub const PAIRING_EXPORT_SIZE: usize = 64;

/// Generate a self-signed X.509 certificate (DER) for an RSA PKCS#8 key.
pub fn generate_self_signed_cert(
    pkcs8_der: &[u8],
    common_name: &str,
    validity: Duration,
) -> Result<Vec<u8>, CryptoError> {
    let pkcs8_key = PrivatePkcs8KeyDer::from(pkcs8_der.to_vec());
    let key_pair = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_key, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + validity;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;
    Ok(cert.der().to_vec())
}

/// Build a TLS 1.3 client config presenting the key pair's certificate and
/// skipping server certificate verification.
pub fn build_client_config(keys: &AdbKeyPair) -> Result<Arc<rustls::ClientConfig>, CryptoError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let cert = CertificateDer::from(keys.certificate_der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(keys.pkcs8_der().to_vec()));

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_client_auth_cert(vec![cert], key)?;

    Ok(Arc::new(config))
}

/// Access to keying material exported from an established TLS session
/// (RFC 5705).
pub trait TlsSession {
    fn export_keying_material(&self, label: &[u8], len: usize) -> Result<Vec<u8>, CryptoError>;
}

impl TlsSession for rustls::ClientConnection {
    fn export_keying_material(&self, label: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
        (**self)
            .export_keying_material(vec![0u8; len], label, None)
            .map_err(|e| CryptoError::KeyingMaterialUnsupported(e.to_string()))
    }
}

impl TlsSession for rustls::ServerConnection {
    fn export_keying_material(&self, label: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
        (**self)
            .export_keying_material(vec![0u8; len], label, None)
            .map_err(|e| CryptoError::KeyingMaterialUnsupported(e.to_string()))
    }
}

/// Certificate verifier that accepts any server certificate but still
/// checks handshake signatures against it.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
