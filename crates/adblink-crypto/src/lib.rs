//! adblink Crypto -- RSA key material, Android public key encoding, TLS
//! client configuration, SPAKE2 pairing authentication.
//!
//! - AUTH signatures: PKCS#1 v1.5 over the raw 20-byte token, SHA-1 prefix
//! - TLS: self-signed RSA certificate as client auth, TLS 1.3 only
//! - Pairing: SPAKE2 (BoringSSL spake25519) -> HKDF-SHA256 -> AES-128-GCM

use sha2::{Digest, Sha256};

pub mod keys;
pub mod pake;
pub mod pubkey;
pub mod spake25519;
pub mod tls;

// Re-exports
pub use keys::{AdbKeyPair, FileKeyProvider, KeyPairProvider, MemoryKeyProvider};
pub use pake::{PairingAuth, PakeRole};
pub use tls::TlsSession;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key error: {0}")]
    Key(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("certificate generation failed: {0}")]
    Certificate(String),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("exporting keying material is not supported: {0}")]
    KeyingMaterialUnsupported(String),
    #[error("key exchange failed: {0}")]
    KeyExchange(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,
    #[error("base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// SHA-256 hash of data, returned as hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
