//! Persisted key/hash-field state shared by the coordinator loops.
//!
//! Every piece of configuration, every flag and the upgrade lock lives in
//! the state store as a field of a named hash. Two implementations exist:
//!
//! - [`SqliteStore`]: durable storage used by the daemon
//! - [`MemoryStore`]: in-process storage for tests and development
//!
//! All loops share one store instance. There is no other cross-loop
//! synchronization, so any read-modify-write that must be atomic goes
//! through [`StateStore::compare_and_set`].

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Hash keys used by the coordinator.
pub mod keys {
    /// Per-workload disabled flags, field = workload name.
    pub const CONTAINER_DISABLED: &str = "SRS_CONTAINER_DISABLED";
    /// Upgrade lock, fields `upgrading` and `desc`.
    pub const UPGRADING: &str = "SRS_UPGRADING";
    /// Maintenance window, fields `start`, `duration`, `update`.
    pub const UPGRADE_WINDOW: &str = "SRS_UPGRADE_WINDOW";
    /// Upgrade strategy, fields `strategy` and `desc`.
    pub const UPGRADE_STRATEGY: &str = "SRS_UPGRADE_STRATEGY";
    /// One-shot upgrade override, field `target`.
    pub const FORCE_UPGRADE: &str = "SRS_FORCE_UPGRADE";
    /// Bootstrap markers, field = release tag.
    pub const FIRST_BOOT: &str = "SRS_FIRST_BOOT";
    /// Platform API secret, fields `token` and `update`.
    pub const PLATFORM_SECRET: &str = "SRS_PLATFORM_SECRET";
    /// Host identity, field `node`.
    pub const HOST_INFO: &str = "SRS_TENCENT_LH";

    // Feature state reported as anonymized usage counters.
    pub const TRANSCODE_CONFIG: &str = "SRS_TRANSCODE_CONFIG";
    pub const RECORD_PATTERNS: &str = "SRS_RECORD_PATTERNS";
    pub const RECORD_M3U8_ARTIFACT: &str = "SRS_RECORD_M3U8_ARTIFACT";
    pub const TENCENT_COS: &str = "SRS_TENCENT_COS";
    pub const TENCENT_VOD: &str = "SRS_TENCENT_VOD";
    pub const DVR_M3U8_ARTIFACT: &str = "SRS_DVR_M3U8_ARTIFACT";
    pub const VOD_M3U8_ARTIFACT: &str = "SRS_VOD_M3U8_ARTIFACT";
    pub const FORWARD_TASK: &str = "SRS_FORWARD_TASK";
    pub const VLIVE_TASK: &str = "SRS_VLIVE_TASK";
}

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached. Callers retry on the next cycle.
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Key/hash-field storage.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read one field of a hash.
    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Write one field of a hash, creating the hash if needed.
    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Delete one field. Returns true if the field existed.
    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Delete a whole hash.
    async fn delete_key(&self, key: &str) -> Result<(), StoreError>;

    /// Number of fields in a hash.
    async fn len(&self, key: &str) -> Result<usize, StoreError>;

    /// Atomically replace a field if its current value equals `expected`.
    ///
    /// `expected = None` means the field must be absent. Returns true if the
    /// write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError>;

    /// Current wall-clock time as seen by the store.
    fn now(&self) -> DateTime<Local>;
}
