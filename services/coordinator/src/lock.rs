//! Upgrade lock.
//!
//! A persisted `{upgrading, desc}` flag that serializes upgrade attempts.
//! Acquisition is a single compare-and-set on the `upgrading` field, so two
//! coordinators sharing a store cannot both win. There is no lease: a holder
//! that crashes leaves the flag set, which is why the owning process clears
//! it once at startup.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::store::{keys, StateStore, StoreError};

const FIELD_HELD: &str = "upgrading";
const FIELD_DESC: &str = "desc";
const HELD: &str = "1";
const FREE: &str = "0";

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Someone else holds the lock.
    #[error("already upgrading: {description}")]
    Held { description: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persisted single-holder flag guarding upgrade attempts.
#[derive(Clone)]
pub struct UpgradeLock {
    store: Arc<dyn StateStore>,
}

impl UpgradeLock {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Take the lock, recording `description` as the holder.
    ///
    /// Fails with [`LockError::Held`] carrying the stored description, which
    /// is left untouched.
    ///
    /// The description is written while the lock is still free, so a held
    /// flag is never paired with an older holder's description and a failed
    /// write leaves nothing held. Two racers may overwrite each other's
    /// description; only one of them wins the flag.
    pub async fn try_acquire(&self, description: &str) -> Result<(), LockError> {
        let current = self.store.get_field(keys::UPGRADING, FIELD_HELD).await?;
        if current.as_deref() == Some(HELD) {
            return Err(self.held().await);
        }

        self.store
            .set_field(keys::UPGRADING, FIELD_DESC, description)
            .await?;

        let won = self
            .store
            .compare_and_set(keys::UPGRADING, FIELD_HELD, current.as_deref(), HELD)
            .await?;
        if !won {
            // Lost a race between the read and the swap.
            return Err(self.held().await);
        }

        debug!(description, "Upgrade lock acquired");
        Ok(())
    }

    /// Mark the lock free. Safe to call when not held.
    pub async fn release(&self) -> Result<(), LockError> {
        self.store
            .set_field(keys::UPGRADING, FIELD_HELD, FREE)
            .await?;
        debug!("Upgrade lock released");
        Ok(())
    }

    /// Run `work` while holding the lock.
    ///
    /// The lock is released whatever `work` returns. A failed release is
    /// logged; the next startup reset clears it.
    pub async fn with_lock<F, T>(&self, description: &str, work: F) -> Result<T, LockError>
    where
        F: Future<Output = T>,
    {
        self.try_acquire(description).await?;
        let output = work.await;
        if let Err(e) = self.release().await {
            error!(error = %e, description, "Failed to release upgrade lock");
        }
        Ok(output)
    }

    /// Whether the lock is currently held, and by what.
    pub async fn holder(&self) -> Result<Option<String>, LockError> {
        let held = self.store.get_field(keys::UPGRADING, FIELD_HELD).await?;
        if held.as_deref() != Some(HELD) {
            return Ok(None);
        }
        let description = self
            .store
            .get_field(keys::UPGRADING, FIELD_DESC)
            .await?
            .unwrap_or_default();
        Ok(Some(description))
    }

    /// Clear a lock left behind by a previous process.
    ///
    /// Returns the stale description if one was cleared.
    pub async fn reset_on_startup(&self) -> Result<Option<String>, LockError> {
        let Some(description) = self.holder().await? else {
            return Ok(None);
        };

        warn!(
            stale_description = %description,
            "Clearing upgrade lock left by a previous run"
        );
        self.store.delete_key(keys::UPGRADING).await?;
        info!("Stale upgrade lock cleared");
        Ok(Some(description))
    }

    async fn held(&self) -> LockError {
        let description = match self.store.get_field(keys::UPGRADING, FIELD_DESC).await {
            Ok(description) => description.unwrap_or_default(),
            Err(e) => return LockError::Store(e),
        };
        LockError::Held { description }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lock() -> (Arc<MemoryStore>, UpgradeLock) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), UpgradeLock::new(store))
    }

    #[tokio::test]
    async fn test_second_acquire_fails_and_keeps_description() {
        let (_, lock) = lock();

        lock.try_acquire("a").await.unwrap();

        let err = lock.try_acquire("b").await.unwrap_err();
        assert!(matches!(err, LockError::Held { ref description } if description == "a"));
        assert_eq!(lock.holder().await.unwrap().as_deref(), Some("a"));

        lock.release().await.unwrap();
        lock.try_acquire("c").await.unwrap();
        assert_eq!(lock.holder().await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_release_when_free_is_harmless() {
        let (_, lock) = lock();
        lock.release().await.unwrap();
        assert_eq!(lock.holder().await.unwrap(), None);
        lock.try_acquire("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_on_startup_clears_stale_lock() {
        let (store, lock) = lock();
        store
            .set_field(keys::UPGRADING, FIELD_HELD, HELD)
            .await
            .unwrap();
        store
            .set_field(keys::UPGRADING, FIELD_DESC, "upgrade to v5.1.0")
            .await
            .unwrap();

        let stale = lock.reset_on_startup().await.unwrap();
        assert_eq!(stale.as_deref(), Some("upgrade to v5.1.0"));
        assert_eq!(lock.holder().await.unwrap(), None);

        assert_eq!(lock.reset_on_startup().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_failure() {
        let (_, lock) = lock();

        let result: Result<(), &str> = lock
            .with_lock("upgrade to v5.1.0", async { Err("boom") })
            .await
            .unwrap();
        assert!(result.is_err());
        assert_eq!(lock.holder().await.unwrap(), None);

        lock.try_acquire("other").await.unwrap();
        let err = lock.with_lock("second", async {}).await.unwrap_err();
        assert!(matches!(err, LockError::Held { ref description } if description == "other"));
    }

    #[tokio::test]
    async fn test_failed_description_write_leaves_lock_free() {
        let (store, lock) = lock();

        store.set_reject_set_field(true);
        assert!(matches!(
            lock.try_acquire("upgrade to v5.1.0").await,
            Err(LockError::Store(_))
        ));
        assert_eq!(lock.holder().await.unwrap(), None);

        let result = lock.with_lock("upgrade to v5.1.0", async {}).await;
        assert!(matches!(result, Err(LockError::Store(_))));
        assert_eq!(lock.holder().await.unwrap(), None);

        store.set_reject_set_field(false);
        lock.try_acquire("upgrade to v5.1.0").await.unwrap();
        assert_eq!(lock.holder().await.unwrap().as_deref(), Some("upgrade to v5.1.0"));
    }

    #[tokio::test]
    async fn test_store_outage_is_not_a_conflict() {
        let (store, lock) = lock();
        store.set_unavailable(true);
        assert!(matches!(
            lock.try_acquire("a").await,
            Err(LockError::Store(StoreError::Unavailable(_)))
        ));
    }
}
