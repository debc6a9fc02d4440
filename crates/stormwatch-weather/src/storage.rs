//! String key/value backends for the forecast cache.
//!
//! The cache store only ever sees `Arc<dyn KvBackend>`, so the same logic
//! runs against SQLite, a JSON file, or plain memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use stormwatch_core::{CacheBackend, CacheConfig, RusqliteErrorExt, StorageError};

/// Durable string-keyed, string-valued storage.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Volatile storage. Used directly in tests and as the fallback when no
/// durable backend can be opened.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// All keys in one pretty-printed JSON object on disk.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileBackend {
    /// Open (or prepare to create) the cache file at `path`.
    ///
    /// A missing file is an empty store. A file that is not a JSON object of
    /// strings is logged and replaced on the next write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entries: BTreeMap<String, String> = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Discarding unreadable cache file {:?}: {}", path, e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl KvBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// SQLite-backed key/value table.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open the cache database at the given path, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(RusqliteErrorExt::into_storage_error)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(RusqliteErrorExt::into_storage_error)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .map_err(RusqliteErrorExt::into_storage_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.conn
            .lock()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(RusqliteErrorExt::into_storage_error)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(RusqliteErrorExt::into_storage_error)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(RusqliteErrorExt::into_storage_error)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// Open the configured backend, degrading to memory when durable storage is
/// unavailable. The fallback is logged but never reported as an error.
pub fn open_backend(config: &CacheConfig, config_dir: &Path) -> Arc<dyn KvBackend> {
    let opened: Result<Arc<dyn KvBackend>, StorageError> =
        match (config.backend, config.resolved_path(config_dir)) {
            (CacheBackend::Sqlite, Some(path)) => {
                SqliteBackend::open(&path).map(|b| Arc::new(b) as Arc<dyn KvBackend>)
            }
            (CacheBackend::File, Some(path)) => {
                FileBackend::open(&path).map(|b| Arc::new(b) as Arc<dyn KvBackend>)
            }
            _ => return Arc::new(MemoryBackend::new()),
        };

    match opened {
        Ok(backend) => {
            tracing::debug!("Forecast cache using {} backend", backend.name());
            backend
        }
        Err(e) => {
            tracing::warn!(
                "Forecast cache unavailable ({}), continuing without persistence",
                e
            );
            Arc::new(MemoryBackend::new())
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    fn exercise(backend: &dyn KvBackend) {
        assert_eq!(backend.get("cachedLat").unwrap(), None);

        backend.set("cachedLat", "52.52").unwrap();
        assert_eq!(backend.get("cachedLat").unwrap().as_deref(), Some("52.52"));

        backend.set("cachedLat", "48.85").unwrap();
        assert_eq!(backend.get("cachedLat").unwrap().as_deref(), Some("48.85"));

        backend.remove("cachedLat").unwrap();
        assert_eq!(backend.get("cachedLat").unwrap(), None);

        // Removing an absent key is not an error
        backend.remove("cachedLat").unwrap();
    }

    #[test]
    fn test_memory_backend() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn test_sqlite_backend() {
        exercise(&SqliteBackend::in_memory().unwrap());
    }

    #[test]
    fn test_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileBackend::open(dir.path().join("cache.json")).unwrap());
    }

    #[test]
    fn test_file_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        FileBackend::open(&path).unwrap().set("data", "[]").unwrap();

        let reopened = FileBackend::open(&path).unwrap();
        assert_eq!(reopened.get("data").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn test_file_backend_recovers_from_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.get("data").unwrap(), None);

        backend.set("data", "[]").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"data\""));
    }

    #[test]
    fn test_sqlite_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        SqliteBackend::open(&path)
            .unwrap()
            .set("lastUpdated", "2026-10-16T09:00:00.000Z")
            .unwrap();

        let reopened = SqliteBackend::open(&path).unwrap();
        assert_eq!(
            reopened.get("lastUpdated").unwrap().as_deref(),
            Some("2026-10-16T09:00:00.000Z")
        );
    }

    #[test]
    fn test_open_backend_memory() {
        let config = CacheConfig {
            backend: CacheBackend::Memory,
            path: None,
        };
        let backend = open_backend(&config, Path::new("/nonexistent"));
        assert_eq!(backend.name(), "memory");
    }

    #[test]
    fn test_open_backend_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the database file should be cannot be opened
        let blocker = dir.path().join("cache.db");
        std::fs::create_dir(&blocker).unwrap();

        let config = CacheConfig {
            backend: CacheBackend::Sqlite,
            path: Some(blocker),
        };
        let backend = open_backend(&config, dir.path());
        assert_eq!(backend.name(), "memory");
        backend.set("k", "v").unwrap();
    }

    #[test]
    fn test_open_backend_sqlite_default_path() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(&CacheConfig::default(), dir.path());
        assert_eq!(backend.name(), "sqlite");
        assert!(dir.path().join("weather_cache.db").exists());
    }
}
