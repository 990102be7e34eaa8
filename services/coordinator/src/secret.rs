//! Platform API secret.
//!
//! The secret authenticates calls to host control. It is created once and
//! never rotated automatically; the periodic task only recreates it if
//! someone deleted it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::client::TokenProvider;
use crate::store::{keys, StateStore, StoreError};

/// Create the API secret if it does not exist.
///
/// Returns the token and whether it was created by this call.
pub async fn ensure_api_secret(store: &dyn StateStore) -> Result<(String, bool), StoreError> {
    if let Some(token) = store.get_field(keys::PLATFORM_SECRET, "token").await? {
        return Ok((token, false));
    }

    let token = format!("srs-v1-{}", uuid::Uuid::new_v4().simple());
    let created = store
        .compare_and_set(keys::PLATFORM_SECRET, "token", None, &token)
        .await?;
    if !created {
        // Someone else created it between the read and the write.
        let existing = store
            .get_field(keys::PLATFORM_SECRET, "token")
            .await?
            .unwrap_or(token);
        return Ok((existing, false));
    }

    store
        .set_field(keys::PLATFORM_SECRET, "update", &store.now().to_rfc3339())
        .await?;
    info!(token_len = token.len(), "Platform API secret created");
    Ok((token, true))
}

/// Token provider that reads the API secret from the store.
pub struct SecretTokenProvider {
    store: Arc<dyn StateStore>,
}

impl SecretTokenProvider {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TokenProvider for SecretTokenProvider {
    async fn token(&self) -> Result<String> {
        match self.store.get_field(keys::PLATFORM_SECRET, "token").await? {
            Some(token) => Ok(token),
            None => anyhow::bail!("platform API secret is not set"),
        }
    }
}

/// Periodically makes sure the API secret exists.
pub struct SecretTask {
    store: Arc<dyn StateStore>,
    interval: Duration,
}

impl SecretTask {
    pub fn new(store: Arc<dyn StateStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "Starting API secret task");

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check().await {
                        error!(error = %e, "API secret check failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("API secret task shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn check(&self) -> Result<(), StoreError> {
        let (token, created) = ensure_api_secret(self.store.as_ref()).await?;
        debug!(token_len = token.len(), created, "API secret checked");
        Ok(())
    }
}
