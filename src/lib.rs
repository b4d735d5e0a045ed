//! SyncGuard Trust Core Library
//!
//! Security primitives for the SyncGuard peer-to-peer device-sync
//! application:
//! - [`SecretStore`]: encrypted-at-rest credential storage with
//!   history-preserving rotation
//! - [`ReplayProtector`]: nonce/timestamp gate rejecting stale and
//!   duplicated messages
//! - [`IntrusionDetector`]: append-only security event log with
//!   subscriber notification
//!
//! The three components share no state; the connection-handling layer
//! composes them.

pub mod intrusion;
pub mod platform;
pub mod replay;
pub mod secrets;

pub use intrusion::{IntrusionConfig, IntrusionDetector, IntrusionEvent, IntrusionKind};
pub use platform::{default_store_path, ensure_data_dir, get_data_dir};
pub use replay::{ReplayProtector, REPLAY_WINDOW};
pub use secrets::cipher::{
    CipherError, KeychainCipher, ObfuscatingCipher, ProtectionMode, SealedBlob, SecretCipher,
};
pub use secrets::{SecretStore, SecretStoreConfig};

use thiserror::Error;

/// Result type for trust core operations
pub type Result<T> = std::result::Result<T, TrustError>;

/// General error type for trust core operations
///
/// Absent keys are not errors (represented as `None`/no-ops); degraded
/// protection is a queryable status, not an error.
#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Cipher error: {0}")]
    Cipher(#[from] secrets::cipher::CipherError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{op} timed out")]
    Timeout { op: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
