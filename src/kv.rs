//! Encrypted key-value primitive the credential store is built on.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};

use crate::crypto::SecretCrypto;
use crate::error::KvError;

/// Opaque string storage keyed by string.
///
/// `put_sync` must not return `Ok` until the write is durable.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, KvError>> + Send;

    fn put(&self, key: &str, value: &str) -> impl Future<Output = Result<(), KvError>> + Send;

    fn put_sync(&self, key: &str, value: &str)
    -> impl Future<Output = Result<(), KvError>> + Send;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), KvError>> + Send;
}

const UPSERT: &str = r#"
    INSERT INTO kv (key, value) VALUES (?1, ?2)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#;

/// Values are sealed with the vault key, using the key name as associated data.
pub struct SqliteKv {
    pool: Pool<Sqlite>,
    crypto: SecretCrypto,
}

impl SqliteKv {
    pub async fn connect(path: &Path, crypto: SecretCrypto) -> Result<Self, KvError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            info!("creating vault database at {}", path.display());
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let kv = Self { pool, crypto };
        kv.migrate().await?;
        Ok(kv)
    }

    async fn migrate(&self) -> Result<(), KvError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key    TEXT PRIMARY KEY,
                value  BLOB NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        debug!("kv schema ensured");
        Ok(())
    }
}

impl KeyValueStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let sealed: Vec<u8> = row.get("value");
        let plain = self.crypto.open(key, &sealed)?;
        String::from_utf8(plain)
            .map(Some)
            .map_err(|_| KvError::Utf8(key.to_string()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        let sealed = self.crypto.seal(key, value.as_bytes())?;
        sqlx::query(UPSERT)
            .bind(key)
            .bind(sealed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_sync(&self, key: &str, value: &str) -> Result<(), KvError> {
        let sealed = self.crypto.seal(key, value.as_bytes())?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(UPSERT)
            .bind(key)
            .bind(sealed)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        // WAL with synchronous=NORMAL only fsyncs at checkpoint.
        sqlx::query("PRAGMA wal_checkpoint(FULL)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let res = sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        debug!("kv delete '{}' -> {}", key, res.rows_affected());
        Ok(())
    }
}

/// In-memory store with switchable failures. Not encrypted; for tests.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
    operations: Mutex<Vec<String>>,
    fail_put: AtomicBool,
    fail_put_sync: AtomicBool,
    fail_delete: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_put(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::SeqCst);
    }

    pub fn fail_put_sync(&self, fail: bool) {
        self.fail_put_sync.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Successful mutations in order, as `"<op> <key>"`.
    pub fn operations(&self) -> Vec<String> {
        self.operations
            .lock()
            .map(|ops| ops.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|e| e.contains_key(key))
            .unwrap_or(false)
    }

    fn record(&self, op: &str, key: &str) {
        if let Ok(mut ops) = self.operations.lock() {
            ops.push(format!("{op} {key}"));
        }
    }

    fn insert(&self, op: &str, key: &str, value: &str) -> Result<(), KvError> {
        self.entries
            .lock()
            .map_err(|_| KvError::Injected("memory store poisoned"))?
            .insert(key.to_string(), value.to_string());
        self.record(op, key);
        Ok(())
    }
}

impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| KvError::Injected("memory store poisoned"))?
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(KvError::Injected("put disabled"));
        }
        self.insert("put", key, value)
    }

    async fn put_sync(&self, key: &str, value: &str) -> Result<(), KvError> {
        if self.fail_put_sync.load(Ordering::SeqCst) {
            return Err(KvError::Injected("put_sync disabled"));
        }
        self.insert("put_sync", key, value)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(KvError::Injected("delete disabled"));
        }
        self.entries
            .lock()
            .map_err(|_| KvError::Injected("memory store poisoned"))?
            .remove(key);
        self.record("delete", key);
        Ok(())
    }
}
