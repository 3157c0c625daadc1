//! Key/value stores backing embedding checkpoints.
//!
//! - [`SmallValueStore`]: synchronous, strict byte quota. Holds checkpoint
//!   metadata.
//! - [`LargeValueStore`]: asynchronous, generous capacity. Holds the texts
//!   payload once it outgrows the inline threshold.
//!
//! [`MemorySmallStore`] and [`MemoryLargeStore`] serve tests and ephemeral
//! runs. [`SqliteLargeStore`] and [`SqliteSmallStore`] persist to the `kv` and
//! `small_kv` tables, which may share one database file.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use encore_core::ErrorClass;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from value stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write would exceed the store quota.
    #[error("quota exceeded writing '{key}': needs {needed} bytes, {available} available")]
    QuotaExceeded {
        /// Key being written.
        key: String,
        /// Bytes the write needs.
        needed: u64,
        /// Bytes left under the quota.
        available: u64,
    },

    /// Backend failure.
    #[error("store backend error: {0}")]
    Backend(String),

    /// `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::Backend(_) | Self::Sqlite(_) => "STORE_BACKEND",
            Self::Serialization(_) => "STORE_SERIALIZATION",
        }
    }

    /// Taxonomy class.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::QuotaExceeded { .. } => ErrorClass::Quota,
            Self::Backend(_) | Self::Sqlite(_) => ErrorClass::Transient,
            Self::Serialization(_) => ErrorClass::InvalidState,
        }
    }

    /// Whether this is a quota failure.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Synchronous key/value store with a tight quota.
pub trait SmallValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value; fails with [`StoreError::QuotaExceeded`] on overflow.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a value. Absent keys are ignored.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Bytes currently used.
    fn used_bytes(&self) -> u64;

    /// Total quota in bytes.
    fn quota_bytes(&self) -> u64;
}

/// Asynchronous key/value store for large payloads.
#[async_trait]
pub trait LargeValueStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value.
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Remove a value. Absent keys are ignored.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory stores
// ─────────────────────────────────────────────────────────────────────────────

fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// In-memory small store. Usage counts key and value bytes.
#[derive(Debug)]
pub struct MemorySmallStore {
    quota: u64,
    inner: Mutex<HashMap<String, String>>,
}

impl MemorySmallStore {
    /// Create an empty store with `quota` bytes.
    pub fn new(quota: u64) -> Self {
        Self {
            quota,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Stored keys, unordered.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }
}

impl SmallValueStore for MemorySmallStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut map = self.inner.lock();
        let used: u64 = map.iter().map(|(k, v)| entry_size(k, v)).sum();
        let replaced = map.get(key).map_or(0, |old| entry_size(key, old));
        let available = self.quota.saturating_sub(used - replaced);
        let needed = entry_size(key, value);
        if needed > available {
            debug!(key, needed, available, "small store quota exceeded");
            return Err(StoreError::QuotaExceeded {
                key: key.to_owned(),
                needed,
                available,
            });
        }
        let _ = map.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _ = self.inner.lock().remove(key);
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.inner.lock().iter().map(|(k, v)| entry_size(k, v)).sum()
    }

    fn quota_bytes(&self) -> u64 {
        self.quota
    }
}

/// Unbounded in-memory large store.
#[derive(Debug, Default)]
pub struct MemoryLargeStore {
    inner: Mutex<HashMap<String, String>>,
    puts: std::sync::atomic::AtomicU64,
}

impl MemoryLargeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl LargeValueStore for MemoryLargeStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let _ = self.puts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let _ = self.inner.lock().insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _ = self.inner.lock().remove(key);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite store
// ─────────────────────────────────────────────────────────────────────────────

const KV_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

/// Large store backed by a `SQLite` `kv` table.
pub struct SqliteLargeStore {
    conn: Mutex<Connection>,
}

impl SqliteLargeStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(open_file(path.as_ref())?)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        let _ = conn.execute(KV_SCHEMA, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl LargeValueStore for SqliteLargeStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let _ = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

const SMALL_KV_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS small_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

fn open_file(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
    Ok(conn)
}

/// Small store backed by a `SQLite` `small_kv` table, quota enforced on
/// key and value bytes.
pub struct SqliteSmallStore {
    quota: u64,
    conn: Mutex<Connection>,
}

impl SqliteSmallStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>, quota: u64) -> Result<Self, StoreError> {
        Self::init(open_file(path.as_ref())?, quota)
    }

    /// Open a private in-memory database.
    pub fn in_memory(quota: u64) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, quota)
    }

    fn init(conn: Connection, quota: u64) -> Result<Self, StoreError> {
        let _ = conn.execute(SMALL_KV_SCHEMA, [])?;
        Ok(Self {
            quota,
            conn: Mutex::new(conn),
        })
    }

    fn used_excluding(conn: &Connection, key: &str) -> Result<u64, StoreError> {
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
             FROM small_kv WHERE key != ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(used.max(0) as u64)
    }
}

impl SmallValueStore for SqliteSmallStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM small_kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let available = self.quota.saturating_sub(Self::used_excluding(&conn, key)?);
        let needed = entry_size(key, value);
        if needed > available {
            debug!(key, needed, available, "small store quota exceeded");
            return Err(StoreError::QuotaExceeded {
                key: key.to_owned(),
                needed,
                available,
            });
        }
        let _ = conn.execute(
            "INSERT INTO small_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let _ = conn.execute("DELETE FROM small_kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        // empty key never matches a stored one
        Self::used_excluding(&self.conn.lock(), "").unwrap_or_else(|e| {
            warn!(error = %e, "failed to measure small store usage");
            0
        })
    }

    fn quota_bytes(&self) -> u64 {
        self.quota
    }
}
