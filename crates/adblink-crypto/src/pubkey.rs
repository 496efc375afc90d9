//! Android's RSA public key format, as found in `adb_keys` on the device.
//!
//! ```text
//! struct RSAPublicKey {        // all little-endian
//!     u32 len;                 // modulus length in 32-bit words (64)
//!     u32 n0inv;               // -1 / n[0] mod 2^32
//!     u8  modulus[256];
//!     u8  rr[256];             // 2^4096 mod n
//!     u32 exponent;
//! }
//! ```
//! Transmitted as base64, optionally followed by `" " + name + "\0"`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};

use crate::CryptoError;

/// Modulus size in bytes. Only 2048-bit keys are representable.
pub const MODULUS_SIZE: usize = 256;

const MODULUS_WORDS: u32 = (MODULUS_SIZE / 4) as u32;

/// Size of the binary structure before base64.
pub const ENCODED_SIZE: usize = 4 + 4 + MODULUS_SIZE + MODULUS_SIZE + 4;

/// Binary Android encoding of `key`.
pub fn encode(key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    let n = key.n();
    let modulus = n.to_bytes_le();
    if modulus.len() > MODULUS_SIZE {
        return Err(CryptoError::Key(format!(
            "modulus is {} bytes, only {MODULUS_SIZE} supported",
            modulus.len()
        )));
    }

    let mut low = [0u8; 4];
    low[..modulus.len().min(4)].copy_from_slice(&modulus[..modulus.len().min(4)]);
    let n0 = u32::from_le_bytes(low);
    if n0 & 1 == 0 {
        return Err(CryptoError::Key("modulus must be odd".into()));
    }

    let rr = (BigUint::from(1u32) << (MODULUS_SIZE * 8 * 2)) % n;

    let exponent = key.e().to_bytes_le();
    if exponent.len() > 4 {
        return Err(CryptoError::Key("public exponent wider than 32 bits".into()));
    }
    let mut e = [0u8; 4];
    e[..exponent.len()].copy_from_slice(&exponent);

    let mut out = Vec::with_capacity(ENCODED_SIZE);
    out.extend_from_slice(&MODULUS_WORDS.to_le_bytes());
    out.extend_from_slice(&inverse_mod_2_32(n0).wrapping_neg().to_le_bytes());
    push_padded(&mut out, &modulus);
    push_padded(&mut out, &rr.to_bytes_le());
    out.extend_from_slice(&e);
    Ok(out)
}

/// Base64 encoding followed by a space, `name` and a NUL terminator.
pub fn encode_with_name(key: &RsaPublicKey, name: &str) -> Result<Vec<u8>, CryptoError> {
    let mut out = BASE64.encode(encode(key)?).into_bytes();
    out.push(b' ');
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    Ok(out)
}

/// Parse `base64[ name]` back into a key and its name.
pub fn decode_with_name(data: &[u8]) -> Result<(RsaPublicKey, String), CryptoError> {
    let text = String::from_utf8_lossy(data);
    let text = text.trim_end_matches(['\0', '\n']);
    let (b64, name) = text.split_once(' ').unwrap_or((text, ""));
    let raw = BASE64.decode(b64)?;
    if raw.len() != ENCODED_SIZE {
        return Err(CryptoError::Key(format!(
            "encoded key is {} bytes, expected {ENCODED_SIZE}",
            raw.len()
        )));
    }

    let words = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    if words != MODULUS_WORDS {
        return Err(CryptoError::Key(format!("unexpected modulus length {words}")));
    }
    let n = BigUint::from_bytes_le(&raw[8..8 + MODULUS_SIZE]);
    let e_at = 8 + 2 * MODULUS_SIZE;
    let e = u32::from_le_bytes([raw[e_at], raw[e_at + 1], raw[e_at + 2], raw[e_at + 3]]);

    let key = RsaPublicKey::new(n, BigUint::from(e)).map_err(|e| CryptoError::Key(e.to_string()))?;
    Ok((key, name.to_string()))
}

fn push_padded(out: &mut Vec<u8>, le_bytes: &[u8]) {
    out.extend_from_slice(le_bytes);
    out.resize(out.len() + MODULUS_SIZE - le_bytes.len(), 0);
}

/// Multiplicative inverse of an odd `x` modulo 2^32 (Newton iteration).
fn inverse_mod_2_32(x: u32) -> u32 {
    let mut inv = x;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(x.wrapping_mul(inv)));
    }
    inv
}
