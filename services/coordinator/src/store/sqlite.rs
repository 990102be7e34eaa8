//! SQLite-backed state store.
//!
//! All hashes live in one `fields` table keyed by `(key, field)`. Each
//! operation is a single statement, which is what makes `compare_and_set`
//! atomic across processes sharing the same database file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{StateStore, StoreError};

/// SQLite state store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL lets a second coordinator process read while we write
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS fields (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (key, field)
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.conn()?
            .query_row(
                "SELECT value FROM fields WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        self.conn()?.execute(
            r#"
            INSERT INTO fields (key, field, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key, field) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, field, value, now],
        )?;
        Ok(())
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let deleted = self.conn()?.execute(
            "DELETE FROM fields WHERE key = ?1 AND field = ?2",
            params![key, field],
        )?;
        Ok(deleted > 0)
    }

    async fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        self.conn()?
            .execute("DELETE FROM fields WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM fields WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn()?;

        let changed = match expected {
            Some(expected) => conn.execute(
                r#"
                UPDATE fields SET value = ?4, updated_at = ?5
                WHERE key = ?1 AND field = ?2 AND value = ?3
                "#,
                params![key, field, expected, value, now],
            )?,
            None => conn.execute(
                r#"
                INSERT OR IGNORE INTO fields (key, field, value, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![key, field, value, now],
            )?,
        };

        Ok(changed == 1)
    }

    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}
