//! One-shot setup per release tag.
//!
//! Each release that needs host-side migration bumps its tag. The marker is
//! written before any action runs, so a crash mid-sequence never reruns it;
//! actions therefore have to be safe to skip as well as to repeat.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info};

use crate::client::HostControl;
use crate::secret::ensure_api_secret;
use crate::store::{keys, StateStore, StoreError};

/// A single bootstrap step.
#[async_trait]
pub trait BootstrapAction: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

/// Runs bootstrap actions at most once per release tag.
pub struct BootstrapRunner {
    store: Arc<dyn StateStore>,
}

impl BootstrapRunner {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Run `actions` unless `release_tag` has already been bootstrapped.
    ///
    /// Returns true if the actions ran. Action failures are logged and do
    /// not stop later actions.
    pub async fn run_once(
        &self,
        release_tag: &str,
        actions: &[Arc<dyn BootstrapAction>],
    ) -> Result<bool, StoreError> {
        let marked = self
            .store
            .compare_and_set(keys::FIRST_BOOT, release_tag, None, "1")
            .await?;
        if !marked {
            info!(release_tag, "Bootstrap already done");
            return Ok(false);
        }

        info!(release_tag, actions = actions.len(), "Running bootstrap");
        for action in actions {
            match action.run().await {
                Ok(()) => info!(action = action.name(), "Bootstrap action done"),
                Err(e) => error!(action = action.name(), error = %e, "Bootstrap action failed"),
            }
        }
        info!(release_tag, "Bootstrap done");

        Ok(true)
    }
}

/// Asks the host to prepare its OS for upgrades. Hosts installed by an
/// older release never ran this step.
pub struct PrepareHost {
    host: Arc<dyn HostControl>,
}

impl PrepareHost {
    pub fn new(host: Arc<dyn HostControl>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl BootstrapAction for PrepareHost {
    fn name(&self) -> &str {
        "prepare-host"
    }

    async fn run(&self) -> Result<()> {
        self.host.prepare_upgrade().await
    }
}

/// Creates the platform API secret if it is missing.
pub struct EnsureApiSecret {
    store: Arc<dyn StateStore>,
}

impl EnsureApiSecret {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BootstrapAction for EnsureApiSecret {
    fn name(&self) -> &str {
        "ensure-api-secret"
    }

    async fn run(&self) -> Result<()> {
        let (token, created) = ensure_api_secret(self.store.as_ref()).await?;
        info!(token_len = token.len(), created, "Platform API secret ready");
        Ok(())
    }
}

/// Removes workload instances so the reconciler recreates them with the
/// current arguments.
pub struct RemoveWorkloads {
    host: Arc<dyn HostControl>,
    names: Vec<String>,
}

impl RemoveWorkloads {
    pub fn new(host: Arc<dyn HostControl>, names: Vec<String>) -> Self {
        Self { host, names }
    }
}

#[async_trait]
impl BootstrapAction for RemoveWorkloads {
    fn name(&self) -> &str {
        "remove-workloads"
    }

    async fn run(&self) -> Result<()> {
        let mut failed = Vec::new();
        for name in &self.names {
            if let Err(e) = self.host.remove_workload(name).await {
                error!(workload = %name, error = %e, "Failed to remove workload");
                failed.push(name.as_str());
            }
        }
        if !failed.is_empty() {
            anyhow::bail!("failed to remove {}", failed.join(", "));
        }
        Ok(())
    }
}
