//! Sealing and opening of secret values.
//!
//! Secure mode keeps a random 256-bit store key in the OS keychain and
//! seals values with AES-256-GCM:
//! - 256-bit key
//! - 96-bit (12 byte) nonce, unique per sealed value
//! - 128-bit authentication tag
//!
//! When no keychain is reachable the store falls back to an obfuscating
//! cipher that is NOT cryptographically secure. The fallback labels its
//! output (`scheme = "obfuscated"`) and reports [`ProtectionMode::Degraded`]
//! so callers can warn the user; it is never silently interchangeable with
//! sealed output.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

/// Keychain service name holding the store key
pub const KEYCHAIN_SERVICE: &str = "syncguard.store";

/// Keychain account name holding the store key
pub const KEYCHAIN_USER: &str = "store-key";

/// Errors that can occur while sealing or opening secret values
#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Secure storage unavailable: {0}")]
    KeychainUnavailable(String),

    #[error("Sealing failed: {0}")]
    SealFailed(String),

    #[error("Opening failed: {0}")]
    OpenFailed(String),

    #[error("Authentication failed - blob may have been tampered with")]
    AuthenticationFailed,
}

/// Result type for cipher operations
pub type Result<T> = std::result::Result<T, CipherError>;

/// Which protection the store is operating under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionMode {
    /// Store key held in the OS keychain, values sealed with AES-256-GCM
    Keychain,
    /// Keychain unavailable, values obfuscated but not encrypted
    Degraded,
}

/// A sealed secret value as persisted on disk
///
/// The scheme tag records which cipher produced the blob, so a blob
/// written in one mode is never misread as the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum SealedBlob {
    /// AES-256-GCM output: unique nonce, ciphertext, split auth tag
    Sealed {
        nonce: [u8; 12],
        ciphertext: Vec<u8>,
        auth_tag: [u8; 16],
    },
    /// Degraded-mode output: obfuscated, base64-encoded bytes
    Obfuscated { data: String },
}

/// Pluggable encrypt/decrypt boundary for the secret store
///
/// Platform-specific secure-storage backends implement this trait so the
/// store's rotation logic never changes per target.
pub trait SecretCipher: Send + Sync {
    /// Which protection mode this cipher provides
    fn mode(&self) -> ProtectionMode;

    /// Seal a plaintext value for persistence
    fn seal(&self, plaintext: &[u8]) -> Result<SealedBlob>;

    /// Open a previously sealed value
    fn open(&self, blob: &SealedBlob) -> Result<Vec<u8>>;
}

/// The 256-bit store key, zeroized on drop
#[derive(ZeroizeOnDrop)]
pub struct StoreKey {
    key: [u8; 32],
}

impl StoreKey {
    /// Generate a new random store key
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Create a store key from raw bytes
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Secure cipher: AES-256-GCM with the store key held in the OS keychain
pub struct KeychainCipher {
    key: StoreKey,
}

impl KeychainCipher {
    /// Load the store key from the OS keychain, creating it on first use.
    ///
    /// Blocking; run under `spawn_blocking` from async contexts.
    pub fn load_or_create() -> Result<Self> {
        let entry = keyring::Entry::new(KEYCHAIN_SERVICE, KEYCHAIN_USER)
            .map_err(|e| CipherError::KeychainUnavailable(e.to_string()))?;

        match entry.get_password() {
            Ok(encoded) => {
                let bytes = BASE64
                    .decode(&encoded)
                    .map_err(|e| CipherError::KeychainUnavailable(format!("stored key: {}", e)))?;
                let key: [u8; 32] = bytes.try_into().map_err(|_| {
                    CipherError::KeychainUnavailable("stored key has wrong length".to_string())
                })?;
                Ok(Self {
                    key: StoreKey::from_bytes(key),
                })
            }
            Err(keyring::Error::NoEntry) => {
                let key = StoreKey::generate();
                entry
                    .set_password(&BASE64.encode(key.as_bytes()))
                    .map_err(|e| CipherError::KeychainUnavailable(e.to_string()))?;
                Ok(Self { key })
            }
            Err(e) => Err(CipherError::KeychainUnavailable(e.to_string())),
        }
    }

    /// Build a cipher from an existing key (tests, custom key provisioning)
    pub fn with_key(key: StoreKey) -> Self {
        Self { key }
    }
}

impl SecretCipher for KeychainCipher {
    fn mode(&self) -> ProtectionMode {
        ProtectionMode::Keychain
    }

    fn seal(&self, plaintext: &[u8]) -> Result<SealedBlob> {
        let cipher = Aes256Gcm::new(self.key.as_bytes().into());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let nonce_bytes: [u8; 12] = nonce.into();

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CipherError::SealFailed(format!("{}", e)))?;

        // AES-GCM appends the auth tag to the ciphertext
        if ciphertext.len() < 16 {
            return Err(CipherError::SealFailed(
                "Ciphertext too short - missing auth tag".to_string(),
            ));
        }

        let tag_start = ciphertext.len() - 16;
        let auth_tag: [u8; 16] = ciphertext[tag_start..]
            .try_into()
            .map_err(|_| CipherError::SealFailed("Invalid auth tag length".to_string()))?;
        let ciphertext_only = ciphertext[..tag_start].to_vec();

        Ok(SealedBlob::Sealed {
            nonce: nonce_bytes,
            ciphertext: ciphertext_only,
            auth_tag,
        })
    }

    fn open(&self, blob: &SealedBlob) -> Result<Vec<u8>> {
        let (nonce, ciphertext, auth_tag) = match blob {
            SealedBlob::Sealed {
                nonce,
                ciphertext,
                auth_tag,
            } => (nonce, ciphertext, auth_tag),
            SealedBlob::Obfuscated { .. } => {
                return Err(CipherError::OpenFailed(
                    "blob was written in degraded mode".to_string(),
                ))
            }
        };

        let cipher = Aes256Gcm::new(self.key.as_bytes().into());
        let nonce = Nonce::from(*nonce);

        let mut ciphertext_with_tag = ciphertext.clone();
        ciphertext_with_tag.extend_from_slice(auth_tag);

        cipher
            .decrypt(&nonce, ciphertext_with_tag.as_slice())
            .map_err(|_| CipherError::AuthenticationFailed)
    }
}

// Fixed key; the point is only to keep casual eyes off the file, and the
// degraded mode is reported to callers as such.
const OBFUSCATION_KEY: &[u8] = b"syncguard-degraded-store";

fn xor_obfuscate(data: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ OBFUSCATION_KEY[i % OBFUSCATION_KEY.len()])
        .collect()
}

/// Degraded cipher used when no OS keychain is reachable
///
/// Obfuscation only, not encryption; reported as [`ProtectionMode::Degraded`].
pub struct ObfuscatingCipher;

impl SecretCipher for ObfuscatingCipher {
    fn mode(&self) -> ProtectionMode {
        ProtectionMode::Degraded
    }

    fn seal(&self, plaintext: &[u8]) -> Result<SealedBlob> {
        Ok(SealedBlob::Obfuscated {
            data: BASE64.encode(xor_obfuscate(plaintext)),
        })
    }

    fn open(&self, blob: &SealedBlob) -> Result<Vec<u8>> {
        match blob {
            SealedBlob::Obfuscated { data } => {
                let bytes = BASE64
                    .decode(data)
                    .map_err(|e| CipherError::OpenFailed(format!("{}", e)))?;
                Ok(xor_obfuscate(&bytes))
            }
            SealedBlob::Sealed { .. } => Err(CipherError::OpenFailed(
                "blob was sealed with the keychain cipher".to_string(),
            )),
        }
    }
}
