//! Durable secret storage with history-preserving rotation.
//!
//! Secrets are persisted as a flat JSON map of key → sealed record in the
//! application data directory. Values pass through the [`SecretCipher`]
//! boundary: the OS keychain backend when available, an obfuscating
//! fallback otherwise (see [`cipher`]).
//!
//! Rotation archives the prior value under `<key>_old_<timestampMillis>`
//! as an independently retrievable record, and makes the archive durable
//! before overwriting the current record.

pub mod cipher;

use crate::platform;
use crate::{Result, TrustError};
use chrono::Utc;
use cipher::{KeychainCipher, ObfuscatingCipher, ProtectionMode, SealedBlob, SecretCipher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const STORE_VERSION: u32 = 1;

/// Secret store configuration
#[derive(Debug, Clone)]
pub struct SecretStoreConfig {
    /// Path of the store file
    pub path: PathBuf,
    /// Deadline for a single persistence write
    pub io_timeout: Duration,
}

impl Default for SecretStoreConfig {
    fn default() -> Self {
        Self {
            path: platform::default_store_path(),
            io_timeout: Duration::from_secs(5),
        }
    }
}

impl SecretStoreConfig {
    /// Configuration with a custom store path
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// One persisted record: a sealed value plus its write time (epoch millis)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    blob: SealedBlob,
    stored_at: i64,
}

/// On-disk shape of the store file
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    records: HashMap<String, StoredRecord>,
}

/// Encrypted-at-rest storage of named secrets
///
/// Cheap to clone; all clones share the same state. Writes to the same
/// key are serialized through a per-key lock, so concurrent rotations
/// cannot interleave; distinct keys proceed independently.
#[derive(Clone)]
pub struct SecretStore {
    inner: Arc<Inner>,
}

struct Inner {
    config: SecretStoreConfig,
    cipher: Box<dyn SecretCipher>,
    records: RwLock<HashMap<String, StoredRecord>>,
    /// One lock per key ever written; pruned by `delete_secret` and `clear`
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Writers hold this shared; `clear` holds it exclusively so a racing
    /// rotation cannot re-insert its records after the wipe
    op_lock: RwLock<()>,
    save_lock: Mutex<()>,
}

impl SecretStore {
    /// Open the store, probing the OS keychain for the store key.
    ///
    /// Falls back to degraded obfuscation when no keychain is reachable;
    /// check [`SecretStore::mode`] and warn the user if it reports
    /// [`ProtectionMode::Degraded`].
    pub async fn open(config: SecretStoreConfig) -> Result<Self> {
        let probe = tokio::task::spawn_blocking(KeychainCipher::load_or_create)
            .await
            .map_err(|e| TrustError::Storage(format!("keychain probe task failed: {}", e)))?;

        let cipher: Box<dyn SecretCipher> = match probe {
            Ok(keychain) => {
                info!("Secret store using OS keychain protection");
                Box::new(keychain)
            }
            Err(e) => {
                warn!(
                    "Secure storage unavailable ({}), falling back to degraded obfuscation",
                    e
                );
                Box::new(ObfuscatingCipher)
            }
        };

        Self::open_with_cipher(config, cipher).await
    }

    /// Open the store with an explicit cipher backend.
    pub async fn open_with_cipher(
        config: SecretStoreConfig,
        cipher: Box<dyn SecretCipher>,
    ) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let records = match tokio::fs::read(&config.path).await {
            Ok(bytes) => match serde_json::from_slice::<StoreFile>(&bytes) {
                Ok(file) => file.records,
                Err(e) => {
                    warn!("Secret store file unreadable, starting empty: {}", e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(
            count = records.len(),
            path = %config.path.display(),
            "Opened secret store"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                cipher,
                records: RwLock::new(records),
                key_locks: Mutex::new(HashMap::new()),
                op_lock: RwLock::new(()),
                save_lock: Mutex::new(()),
            }),
        })
    }

    /// Which protection mode the store is operating under
    pub fn mode(&self) -> ProtectionMode {
        self.inner.cipher.mode()
    }

    /// Store a secret, overwriting any current record for `key`.
    pub async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        let _op = self.inner.op_lock.read().await;
        let lock = self.key_lock(key).await;
        let _guard = lock.lock().await;

        let blob = self.inner.cipher.seal(value)?;
        {
            let mut records = self.inner.records.write().await;
            records.insert(
                key.to_string(),
                StoredRecord {
                    blob,
                    stored_at: Utc::now().timestamp_millis(),
                },
            );
        }
        self.persist().await
    }

    /// Fetch a secret.
    ///
    /// Returns `Ok(None)` when the key is absent or its stored blob no
    /// longer opens to a valid value; a missing secret is an expected
    /// outcome, not a fault.
    pub async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let records = self.inner.records.read().await;
        let Some(record) = records.get(key) else {
            return Ok(None);
        };

        match self.inner.cipher.open(&record.blob) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, "Stored secret failed to open: {}", e);
                Ok(None)
            }
        }
    }

    /// Remove the current record for `key`; no-op if absent.
    pub async fn delete_secret(&self, key: &str) -> Result<()> {
        let _op = self.inner.op_lock.read().await;
        let lock = self.key_lock(key).await;
        {
            let _guard = lock.lock().await;

            let removed = {
                let mut records = self.inner.records.write().await;
                records.remove(key).is_some()
            };
            if removed {
                self.persist().await?;
            }
        }

        // prune this key's lock entry when no other task holds a handle
        let mut locks = self.inner.key_locks.lock().await;
        if let Some(existing) = locks.get(key) {
            if Arc::ptr_eq(existing, &lock) && Arc::strong_count(existing) == 2 {
                locks.remove(key);
            }
        }
        Ok(())
    }

    /// Every key currently persisted, archived (`*_old_*`) keys included.
    pub async fn list_secrets(&self) -> BTreeSet<String> {
        let records = self.inner.records.read().await;
        records.keys().cloned().collect()
    }

    /// Rotate a secret: archive the current value, then overwrite it.
    ///
    /// The archive record `<key>_old_<timestampMillis>` is made durable
    /// before the current record is overwritten, so a mid-rotation failure
    /// never loses the prior value. Concurrent readers of `key` observe
    /// either the old or the new value, never neither.
    pub async fn rotate_secret(&self, key: &str, new_value: &[u8]) -> Result<()> {
        let _op = self.inner.op_lock.read().await;
        let lock = self.key_lock(key).await;
        let _guard = lock.lock().await;

        let current = {
            let records = self.inner.records.read().await;
            records.get(key).cloned()
        };

        if let Some(current) = current {
            let archive_key = {
                let records = self.inner.records.read().await;
                let mut ts = Utc::now().timestamp_millis();
                loop {
                    let candidate = format!("{}_old_{}", key, ts);
                    if !records.contains_key(&candidate) {
                        break candidate;
                    }
                    // same-millisecond rotation; keep archive keys distinct
                    ts += 1;
                }
            };

            {
                let mut records = self.inner.records.write().await;
                records.insert(archive_key.clone(), current);
            }
            self.persist().await?;
            debug!(key, archive = archive_key.as_str(), "Archived secret before rotation");
        }

        let blob = self.inner.cipher.seal(new_value)?;
        {
            let mut records = self.inner.records.write().await;
            records.insert(
                key.to_string(),
                StoredRecord {
                    blob,
                    stored_at: Utc::now().timestamp_millis(),
                },
            );
        }
        self.persist().await
    }

    /// Remove every record, current and archived. Destructive.
    ///
    /// Exclusive against in-flight writers: a rotation racing `clear`
    /// either completes before the wipe or starts after it, never
    /// straddles it.
    pub async fn clear(&self) -> Result<()> {
        let _op = self.inner.op_lock.write().await;
        {
            let mut records = self.inner.records.write().await;
            records.clear();
        }
        // no writer can hold a key lock while we hold the op lock
        self.inner.key_locks.lock().await.clear();
        self.persist().await
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.key_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Write the full store to disk: temp file + rename, bounded by the
    /// configured I/O timeout.
    async fn persist(&self) -> Result<()> {
        let _guard = self.inner.save_lock.lock().await;

        let file = {
            let records = self.inner.records.read().await;
            StoreFile {
                version: STORE_VERSION,
                records: records.clone(),
            }
        };
        let bytes =
            serde_json::to_vec_pretty(&file).map_err(|e| TrustError::Serialization(e.to_string()))?;

        let path = &self.inner.config.path;
        let tmp = path.with_extension("json.tmp");
        let write = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, path).await?;
            Ok::<(), std::io::Error>(())
        };

        match tokio::time::timeout(self.inner.config.io_timeout, write).await {
            Ok(result) => result.map_err(TrustError::Io),
            Err(_) => Err(TrustError::Timeout {
                op: "secret store write",
            }),
        }
    }
}
