//! RSA-2048 ADB key pair -- generation, loading, rotation, AUTH signing.

use parking_lot::RwLock;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::{pubkey, sha256_hex, tls, CryptoError};

/// Modulus size of generated keys.
pub const KEY_BITS: usize = 2048;

/// Lifetime of the self-signed certificate minted at load time.
pub const DEFAULT_CERT_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// File name of the private key inside the key directory.
pub const KEY_FILE_NAME: &str = "adbkey.pk8";

/// Private key plus everything derived from it.
pub struct AdbKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    pkcs8: Zeroizing<Vec<u8>>,
    certificate: Vec<u8>,
    key_name: String,
}

impl AdbKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = rand::rngs::OsRng;
        let key =
            RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(|e| CryptoError::Key(e.to_string()))?;
        Self::from_private_key(key)
    }

    /// Load from PKCS#8 DER bytes.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|e| CryptoError::Key(e.to_string()))?;
        Self::from_private_key(key)
    }

    /// Load key pair from PKCS#8 DER file.
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let der = Zeroizing::new(std::fs::read(path)?);
        Self::from_pkcs8_der(&der)
    }

    /// Load or create key pair at path.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            let keys = Self::generate()?;
            keys.save(path)?;
            Ok(keys)
        }
    }

    /// Write the PKCS#8 DER to `path`, readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.pkcs8.as_slice())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, CryptoError> {
        let pkcs8 = private_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::Key(e.to_string()))?;
        let pkcs8 = Zeroizing::new(pkcs8.as_bytes().to_vec());
        let key_name = key_name_for(&pkcs8);
        let certificate = tls::generate_self_signed_cert(&pkcs8, &key_name, DEFAULT_CERT_VALIDITY)?;

        Ok(Self {
            public_key: RsaPublicKey::from(&private_key),
            private_key,
            pkcs8,
            certificate,
            key_name,
        })
    }

    /// Short stable name derived from the private key, shown on the device.
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// PKCS#8 DER bytes.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    /// Self-signed X.509 certificate (DER) for TLS client auth.
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate
    }

    /// Sign an AUTH token. The token is used as a precomputed SHA-1 digest.
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private_key
            .sign(Pkcs1v15Sign::new::<Sha1>(), token)
            .map_err(|e| CryptoError::Signing(e.to_string()))
    }

    /// Public key in Android format, named with the key name.
    pub fn android_public_key(&self) -> Result<Vec<u8>, CryptoError> {
        pubkey::encode_with_name(&self.public_key, &self.key_name)
    }

    /// Public key in Android format with a caller-chosen name.
    pub fn android_public_key_named(&self, name: &str) -> Result<Vec<u8>, CryptoError> {
        pubkey::encode_with_name(&self.public_key, name)
    }

    /// SHA-256 of the Android-encoded public key, hex.
    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        Ok(sha256_hex(&pubkey::encode(&self.public_key)?))
    }
}

impl std::fmt::Debug for AdbKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbKeyPair")
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}

fn key_name_for(pkcs8: &[u8]) -> String {
    let digest = sha256_hex(pkcs8);
    format!("ADBLink-{}", digest[..4].to_ascii_uppercase())
}

// ============================================================================
// Providers
// ============================================================================

/// Source of the key pair used by connections and pairing.
pub trait KeyPairProvider: Send + Sync {
    fn current(&self) -> Result<Arc<AdbKeyPair>, CryptoError>;

    /// Replace the key pair with a freshly generated one.
    fn rotate(&self) -> Result<Arc<AdbKeyPair>, CryptoError>;
}

/// Key pair held in memory only.
pub struct MemoryKeyProvider {
    keys: RwLock<Arc<AdbKeyPair>>,
}

impl MemoryKeyProvider {
    pub fn new(keys: Arc<AdbKeyPair>) -> Self {
        Self {
            keys: RwLock::new(keys),
        }
    }

    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self::new(Arc::new(AdbKeyPair::generate()?)))
    }
}

impl KeyPairProvider for MemoryKeyProvider {
    fn current(&self) -> Result<Arc<AdbKeyPair>, CryptoError> {
        Ok(self.keys.read().clone())
    }

    fn rotate(&self) -> Result<Arc<AdbKeyPair>, CryptoError> {
        let fresh = Arc::new(AdbKeyPair::generate()?);
        *self.keys.write() = fresh.clone();
        Ok(fresh)
    }
}

/// Key pair persisted as `<dir>/adbkey.pk8`, created on first use.
pub struct FileKeyProvider {
    path: PathBuf,
    cached: RwLock<Option<Arc<AdbKeyPair>>>,
}

impl FileKeyProvider {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(KEY_FILE_NAME),
            cached: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyPairProvider for FileKeyProvider {
    fn current(&self) -> Result<Arc<AdbKeyPair>, CryptoError> {
        if let Some(keys) = self.cached.read().as_ref() {
            return Ok(keys.clone());
        }

        let mut cached = self.cached.write();
        if let Some(keys) = cached.as_ref() {
            return Ok(keys.clone());
        }
        let keys = Arc::new(AdbKeyPair::load_or_create(&self.path)?);
        tracing::info!(path = %self.path.display(), key_name = keys.key_name(), "loaded adb key");
        *cached = Some(keys.clone());
        Ok(keys)
    }

    fn rotate(&self) -> Result<Arc<AdbKeyPair>, CryptoError> {
        let mut cached = self.cached.write();
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let keys = Arc::new(AdbKeyPair::load_or_create(&self.path)?);
        tracing::info!(path = %self.path.display(), key_name = keys.key_name(), "rotated adb key");
        *cached = Some(keys.clone());
        Ok(keys)
    }
}

/// Shared 2048-bit key for tests; generation is too slow to repeat.
#[cfg(test)]
pub(crate) fn test_key() -> &'static AdbKeyPair {
    static KEY: std::sync::OnceLock<AdbKeyPair> = std::sync::OnceLock::new();
    KEY.get_or_init(|| AdbKeyPair::generate().unwrap())
}
