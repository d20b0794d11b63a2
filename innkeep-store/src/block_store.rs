//! Encrypted block store
//!
//! Seals opaque byte blobs with AES-256-GCM and keeps them in a persistent
//! key/value facility. The key is derived with PBKDF2 from a stable device
//! identifier and the application salt, so a device can always reopen its
//! own snapshots.
//!
//! Container layout:
//!
//! ```text
//! | "IKSN" (4) | version (1) | nonce (12) | ciphertext + tag |
//! ```
//!
//! The logical key a blob is stored under is bound as associated data, so a
//! container copied to another key fails to open.

use crate::error::{StoreError, StoreResult};
use crate::value::now_timestamp;
use async_trait::async_trait;
use crypto::{Aes256GcmEncryptor, Encryptor, Kdf, Pbkdf2Params};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CONTAINER_MAGIC: &[u8; 4] = b"IKSN";
pub const CONTAINER_VERSION: u8 = 1;

/// Key under which a generated device identifier is kept
pub const DEVICE_ID_KEY: &str = "device_id";

/// Persistent key/value facility holding raw bytes
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Write `value` under `key`, atomically replacing any prior value
    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Returns whether a value was removed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    fn name(&self) -> &'static str;
}

/// SQLite file with a single `kv_store` table
pub struct SqliteKvBackend {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteKvBackend {
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        // one connection keeps writes strictly ordered
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA secure_delete = ON")
            .execute(&pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        tracing::debug!(path = %path.display(), "Opened key/value store");

        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl KvBackend for SqliteKvBackend {
    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<Vec<u8>, _>("value")?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// Volatile backend for tests and ephemeral stores
#[derive(Default)]
pub struct MemoryKvBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, simulating a full or read-only disk
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrite raw stored bytes, bypassing encryption
    pub async fn put_raw(&self, key: &str, value: Vec<u8>) {
        self.entries.lock().await.insert(key.to_string(), value);
    }
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Internal(format!(
                "write to {key} rejected by memory backend"
            )));
        }
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Return the configured device identifier, or the one persisted in the
/// backend, generating and storing a new token on first use.
pub async fn resolve_device_id(
    backend: &dyn KvBackend,
    configured: Option<&str>,
) -> StoreResult<String> {
    if let Some(device_id) = configured.filter(|id| !id.trim().is_empty()) {
        return Ok(device_id.to_string());
    }

    if let Some(raw) = backend.get(DEVICE_ID_KEY).await? {
        return String::from_utf8(raw).map_err(|_| {
            StoreError::Internal("stored device identifier is not valid UTF-8".to_string())
        });
    }

    let device_id = Uuid::new_v4().simple().to_string();
    backend.put(DEVICE_ID_KEY, device_id.as_bytes()).await?;
    tracing::info!(backend = backend.name(), "Generated new device identifier");
    Ok(device_id)
}

/// Authenticated-encryption layer over a [`KvBackend`]
pub struct EncryptedBlockStore {
    backend: Arc<dyn KvBackend>,
    encryptor: Aes256GcmEncryptor,
}

impl EncryptedBlockStore {
    /// Derive the snapshot key and wrap `backend`
    pub fn open(
        backend: Arc<dyn KvBackend>,
        device_id: &str,
        app_salt: &str,
        iterations: u32,
    ) -> StoreResult<Self> {
        let key = Kdf::derive_aes256_key(
            device_id.as_bytes(),
            app_salt.as_bytes(),
            &Pbkdf2Params { iterations },
        )?;
        let encryptor = Aes256GcmEncryptor::new(*key)?.with_version(CONTAINER_VERSION);

        tracing::debug!(
            backend = backend.name(),
            key_fingerprint = %encryptor.fingerprint(),
            "Opened encrypted block store"
        );

        Ok(Self { backend, encryptor })
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let sealed = self.encryptor.seal(bytes, key.as_bytes())?;

        let mut container = Vec::with_capacity(CONTAINER_MAGIC.len() + sealed.len());
        container.extend_from_slice(CONTAINER_MAGIC);
        container.extend_from_slice(&sealed);

        self.backend.put(key, &container).await
    }

    /// `Ok(None)` when nothing was ever written under `key`
    pub async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let Some(container) = self.backend.get(key).await? else {
            return Ok(None);
        };

        let sealed = container
            .strip_prefix(CONTAINER_MAGIC.as_slice())
            .ok_or_else(|| {
                StoreError::DecryptionFailure(format!("{key}: missing container header"))
            })?;

        self.encryptor
            .open(sealed, key.as_bytes())
            .map(Some)
            .map_err(|err| StoreError::DecryptionFailure(format!("{key}: {err}")))
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.backend.delete(key).await
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Non-secret identifier of the derived key, for diagnostics
    pub fn key_fingerprint(&self) -> String {
        self.encryptor.fingerprint()
    }
}
