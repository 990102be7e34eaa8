//! In-memory state store for tests and development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Local};

use super::{StateStore, StoreError};

type Hashes = HashMap<String, BTreeMap<String, String>>;

/// In-memory store.
///
/// The clock can be pinned and the store can be made to fail every call,
/// which is how tests exercise window gating and transient outages.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Hashes>,
    clock: Mutex<Option<DateTime<Local>>>,
    unavailable: AtomicBool,
    reject_set_field: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store whose clock always reads `now`.
    pub fn with_clock(now: DateTime<Local>) -> Self {
        let store = Self::default();
        store.set_clock(now);
        store
    }

    /// Pin the clock.
    pub fn set_clock(&self, now: DateTime<Local>) {
        if let Ok(mut clock) = self.clock.lock() {
            *clock = Some(now);
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `set_field` fail while every other call keeps working.
    pub fn set_reject_set_field(&self, reject: bool) {
        self.reject_set_field.store(reject, Ordering::SeqCst);
    }

    fn data(&self) -> Result<MutexGuard<'_, Hashes>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        self.data
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .data()?
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        if self.reject_set_field.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store rejected write".to_string()));
        }
        self.data()?
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut data = self.data()?;
        let Some(hash) = data.get_mut(key) else {
            return Ok(false);
        };
        let existed = hash.remove(field).is_some();
        if hash.is_empty() {
            data.remove(key);
        }
        Ok(existed)
    }

    async fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        self.data()?.remove(key);
        Ok(())
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.data()?.get(key).map_or(0, BTreeMap::len))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut data = self.data()?;
        let hash = data.entry(key.to_string()).or_default();

        if hash.get(field).map(String::as_str) != expected {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    fn now(&self) -> DateTime<Local> {
        self.clock
            .lock()
            .ok()
            .and_then(|clock| *clock)
            .unwrap_or_else(Local::now)
    }
}
