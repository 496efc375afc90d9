//! Pairing authentication -- SPAKE2 over the pairing code, then AES-128-GCM.
//!
//! The client is SPAKE2 Alice and the device is Bob, with fixed NUL-terminated
//! identities. The 64-byte shared key is expanded with HKDF-SHA256 into a
//! 16-byte AES-GCM key. Each direction numbers its messages; the counter is the
//! little-endian start of the 12-byte nonce.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, NONCE_LEN};
use ring::hkdf;

use crate::spake25519::{Spake2Role, Spake25519};
use crate::CryptoError;

const CLIENT_NAME: &[u8] = b"adb pair client\0";
const SERVER_NAME: &[u8] = b"adb pair server\0";
const HKDF_INFO: &[u8] = b"adb pairing_auth aes-128-gcm key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakeRole {
    Client,
    Server,
}

/// One side of a pairing key exchange.
pub struct PairingAuth {
    role: PakeRole,
    spake: Option<Spake25519>,
    cipher: Option<PairingCipher>,
}

struct PairingCipher {
    key: LessSafeKey,
    enc_seq: u64,
    dec_seq: u64,
}

impl PairingAuth {
    /// Start the exchange. `password` is the pairing code followed by the
    /// exported TLS keying material.
    pub fn new(role: PakeRole, password: &[u8]) -> Result<Self, CryptoError> {
        let spake = match role {
            PakeRole::Client => {
                Spake25519::new(Spake2Role::Alice, CLIENT_NAME, SERVER_NAME, password)?
            }
            PakeRole::Server => {
                Spake25519::new(Spake2Role::Bob, SERVER_NAME, CLIENT_NAME, password)?
            }
        };
        Ok(Self {
            role,
            spake: Some(spake),
            cipher: None,
        })
    }

    pub fn role(&self) -> PakeRole {
        self.role
    }

    /// Our SPAKE2 message for the peer. Empty once the exchange finished.
    pub fn message(&self) -> &[u8] {
        match &self.spake {
            Some(spake) => &spake.message()[..],
            None => &[],
        }
    }

    /// Finish SPAKE2 with the peer's message and derive the AEAD key.
    pub fn init_cipher(&mut self, their_message: &[u8]) -> Result<(), CryptoError> {
        let spake = self
            .spake
            .take()
            .ok_or_else(|| CryptoError::KeyExchange("key exchange already finished".into()))?;
        let secret = spake.finish(their_message)?;

        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]).extract(&secret[..]);
        let info = [HKDF_INFO];
        let okm = prk
            .expand(&info, &AES_128_GCM)
            .map_err(|_| CryptoError::KeyExchange("hkdf expand failed".into()))?;

        self.cipher = Some(PairingCipher {
            key: LessSafeKey::new(UnboundKey::from(okm)),
            enc_seq: 0,
            dec_seq: 0,
        });
        Ok(())
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self
            .cipher
            .as_mut()
            .ok_or_else(|| CryptoError::EncryptionFailed("cipher not initialised".into()))?;

        let nonce = sequence_nonce(cipher.enc_seq);
        let mut in_out = plaintext.to_vec();
        cipher
            .key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::EncryptionFailed("seal failed".into()))?;
        cipher.enc_seq += 1;
        Ok(in_out)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher.as_mut().ok_or(CryptoError::DecryptionFailed)?;

        let nonce = sequence_nonce(cipher.dec_seq);
        let mut in_out = ciphertext.to_vec();
        let plaintext = cipher
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let len = plaintext.len();
        cipher.dec_seq += 1;
        in_out.truncate(len);
        Ok(in_out)
    }
}

fn sequence_nonce(seq: u64) -> Nonce {
    let mut bytes = [0u8; NONCE_LEN];
    bytes[..8].copy_from_slice(&seq.to_le_bytes());
    Nonce::assume_unique_for_key(bytes)
}
