use crate::config::StoreConfig;
use crate::error::{CoreError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Shared SQLite store backing the dedup set, the work queues and the local
/// document index.
///
/// A handle owns one connection. Several handles (threads or processes) may
/// open the same file; SQLite's locking makes their transactions atomic with
/// respect to each other.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl Database {
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn remove(path: &Path) -> std::io::Result<()> {
        fs::remove_file(path)
    }

    pub fn new(path: &Path) -> Result<Self> {
        Self::open(path, &StoreConfig::default())
    }

    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        Ok(Self::try_open(path, config)?)
    }

    fn try_open(path: &Path, config: &StoreConfig) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(config.busy_timeout())?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        let db = Database {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open the store, retrying with exponential backoff when it is locked or
    /// unreachable. Gives up after `connect_attempts` tries.
    pub async fn open_with_backoff(path: &Path, config: &StoreConfig) -> Result<Self> {
        let attempts = config.connect_attempts.max(1);
        let mut backoff_ms = config.connect_initial_backoff_ms;

        for attempt in 1..=attempts {
            match Self::try_open(path, config) {
                Ok(db) => {
                    if attempt > 1 {
                        info!("Connected to {} after {} attempts", path.display(), attempt);
                    }
                    return Ok(db);
                }
                Err(err) if attempt < attempts => {
                    warn!(
                        attempt,
                        "Could not open {}: {}; retrying in {}ms",
                        path.display(),
                        err,
                        backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms
                        .saturating_mul(2)
                        .min(config.connect_max_backoff_ms);
                }
                Err(source) => {
                    return Err(CoreError::Unavailable {
                        path: path.to_path_buf(),
                        attempts,
                        source,
                    });
                }
            }
        }

        unreachable!("the final attempt always returns")
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.lock().execute_batch(
            "
            -- Every URL ever admitted. Rows are never deleted.
            CREATE TABLE IF NOT EXISTS seen_urls (
                url TEXT PRIMARY KEY,
                admitted_at INTEGER NOT NULL
            ) WITHOUT ROWID;

            -- Durable work queues with leased, at-least-once delivery
            CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending' CHECK(state IN ('pending', 'leased', 'done')),
                outcome TEXT CHECK(outcome IN ('success', 'skip', 'failure')),
                deliveries INTEGER NOT NULL DEFAULT 0,
                lease_token TEXT,
                visible_at INTEGER NOT NULL,  -- pending: not before; leased: lease expiry (ms)
                enqueued_at INTEGER NOT NULL,
                completed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_queue_ready ON queue_messages(queue, state, visible_at, id);

            -- Local document index, upserted by URL
            CREATE TABLE IF NOT EXISTS documents (
                url TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                rank_score REAL NOT NULL,
                indexed_at INTEGER NOT NULL
            );
            ",
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection while holding this handle's lock.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        Ok(f(&mut conn)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        assert!(!Database::exists(&db_path));
        let db = Database::new(&db_path).unwrap();
        assert!(Database::exists(&db_path));
        assert_eq!(db.path(), db_path.as_path());
    }

    #[test]
    fn test_schema_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let _first = Database::new(&db_path).unwrap();
        let second = Database::new(&db_path).unwrap();
        let tables: i64 = second
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('seen_urls', 'queue_messages', 'documents')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[tokio::test]
    async fn test_open_with_backoff_gives_up() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("missing-dir").join("test.db");
        let config = StoreConfig {
            connect_attempts: 2,
            connect_initial_backoff_ms: 1,
            connect_max_backoff_ms: 1,
            ..StoreConfig::default()
        };

        let err = Database::open_with_backoff(&db_path, &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Unavailable { attempts: 2, .. }));
    }
}
