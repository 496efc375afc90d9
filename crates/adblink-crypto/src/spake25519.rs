//! SPAKE2 over edwards25519 -- the BoringSSL `spake25519` construction.
//!
//! adbd pairs through BoringSSL, so the generator points, the password
//! scalar and the transcript hash all follow its encoding:
//!
//! - M and N are the first valid point encodings in the SHA-256 chain of
//!   "edwards25519 point generation seed (M)" / "(N)".
//! - The private scalar is a uniform scalar times the cofactor, so the
//!   peer's torsion component vanishes in the shared point.
//! - The password scalar is SHA-512(password) reduced mod l, lifted by
//!   multiples of l until it is divisible by eight.
//! - The key is SHA-512 over length-prefixed names, messages, the shared
//!   point and the password hash, in Alice-first order.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, Zeroizing};

use crate::CryptoError;

/// Encoded M point.
const M_POINT: [u8; 32] = [
    0x5a, 0xda, 0x7e, 0x4b, 0xf6, 0xdd, 0xd9, 0xad, 0xb6, 0x62, 0x6d, 0x32, 0x13, 0x1c, 0x6b, 0x5c,
    0x51, 0xa1, 0xe3, 0x47, 0xa3, 0x47, 0x8f, 0x53, 0xcf, 0xcf, 0x44, 0x1b, 0x88, 0xee, 0xd1, 0x2e,
];

/// Encoded N point.
const N_POINT: [u8; 32] = [
    0x10, 0xe3, 0xdf, 0x0a, 0xe3, 0x7d, 0x8e, 0x7a, 0x99, 0xb5, 0xfe, 0x74, 0xb4, 0x46, 0x72, 0x10,
    0x3d, 0xbd, 0xdc, 0xbd, 0x06, 0xaf, 0x68, 0x0d, 0x71, 0x32, 0x9a, 0x11, 0x69, 0x3b, 0xc7, 0x78,
];

pub const MESSAGE_SIZE: usize = 32;
pub const KEY_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spake2Role {
    Alice,
    Bob,
}

/// One side of a SPAKE2 exchange. Consumed by [`Spake25519::finish`].
pub struct Spake25519 {
    role: Spake2Role,
    my_name: Vec<u8>,
    their_name: Vec<u8>,
    /// Private scalar before the cofactor is applied.
    private_key: Scalar,
    /// Password scalar divided by the cofactor.
    password_scalar: Scalar,
    password_hash: Zeroizing<[u8; 64]>,
    my_msg: [u8; MESSAGE_SIZE],
}

impl Spake25519 {
    pub fn new(
        role: Spake2Role,
        my_name: &[u8],
        their_name: &[u8],
        password: &[u8],
    ) -> Result<Self, CryptoError> {
        let mut seed = Zeroizing::new([0u8; 64]);
        rand::rngs::OsRng.fill_bytes(&mut seed[..]);
        Self::with_seed(role, my_name, their_name, password, &seed)
    }

    fn with_seed(
        role: Spake2Role,
        my_name: &[u8],
        their_name: &[u8],
        password: &[u8],
        seed: &[u8; 64],
    ) -> Result<Self, CryptoError> {
        let private_key = Scalar::from_bytes_mod_order_wide(seed);

        let mut password_hash = Zeroizing::new([0u8; 64]);
        password_hash.copy_from_slice(&Sha512::digest(password));
        let mut reduced = Scalar::from_bytes_mod_order_wide(&password_hash);
        let password_scalar = reduced * cofactor().invert();
        reduced.zeroize();

        let public = EdwardsPoint::mul_base(&(private_key * cofactor()));
        let mask = own_generator(role)?.mul_by_cofactor() * password_scalar;
        let my_msg = (public + mask).compress().to_bytes();

        Ok(Self {
            role,
            my_name: my_name.to_vec(),
            their_name: their_name.to_vec(),
            private_key,
            password_scalar,
            password_hash,
            my_msg,
        })
    }

    pub fn role(&self) -> Spake2Role {
        self.role
    }

    pub fn message(&self) -> &[u8; MESSAGE_SIZE] {
        &self.my_msg
    }

    /// Unmask the peer's message and derive the 64-byte shared key.
    pub fn finish(mut self, their_msg: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        let encoded: [u8; MESSAGE_SIZE] = their_msg.try_into().map_err(|_| {
            CryptoError::KeyExchange(format!("peer message is {} bytes", their_msg.len()))
        })?;
        let their_point = CompressedEdwardsY(encoded)
            .decompress()
            .ok_or_else(|| CryptoError::KeyExchange("peer message is not a curve point".into()))?;

        let peers_mask = peer_generator(self.role)?.mul_by_cofactor() * self.password_scalar;
        let shared = ((their_point - peers_mask).mul_by_cofactor() * self.private_key)
            .compress()
            .to_bytes();

        let mut hash = Sha512::new();
        match self.role {
            Spake2Role::Alice => {
                update_prefixed(&mut hash, &self.my_name);
                update_prefixed(&mut hash, &self.their_name);
                update_prefixed(&mut hash, &self.my_msg);
                update_prefixed(&mut hash, &encoded);
            }
            Spake2Role::Bob => {
                update_prefixed(&mut hash, &self.their_name);
                update_prefixed(&mut hash, &self.my_name);
                update_prefixed(&mut hash, &encoded);
                update_prefixed(&mut hash, &self.my_msg);
            }
        }
        update_prefixed(&mut hash, &shared);
        update_prefixed(&mut hash, &self.password_hash[..]);

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&hash.finalize());
        self.private_key.zeroize();
        self.password_scalar.zeroize();
        Ok(key)
    }
}

fn cofactor() -> Scalar {
    Scalar::from(8u8)
}

fn decode_generator(encoded: [u8; 32]) -> Result<EdwardsPoint, CryptoError> {
    CompressedEdwardsY(encoded)
        .decompress()
        .ok_or_else(|| CryptoError::KeyExchange("invalid spake2 generator".into()))
}

fn own_generator(role: Spake2Role) -> Result<EdwardsPoint, CryptoError> {
    match role {
        Spake2Role::Alice => decode_generator(M_POINT),
        Spake2Role::Bob => decode_generator(N_POINT),
    }
}

fn peer_generator(role: Spake2Role) -> Result<EdwardsPoint, CryptoError> {
    match role {
        Spake2Role::Alice => decode_generator(N_POINT),
        Spake2Role::Bob => decode_generator(M_POINT),
    }
}

fn update_prefixed(hash: &mut Sha512, data: &[u8]) {
    hash.update((data.len() as u64).to_le_bytes());
    hash.update(data);
}
