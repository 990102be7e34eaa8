//! Operator settings persisted in the state store.
//!
//! Both loops read these through [`Settings`]; the request surface that lets
//! an operator change them is external and writes through the same facade.

use std::fmt;
use std::sync::Arc;

use stack_reconcile::{validate_window, MaintenanceWindow};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::error::CoordinatorError;
use crate::store::{keys, StateStore, StoreError};

/// Whether upgrades may run without an operator asking for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStrategy {
    Auto,
    Manual,
}

impl UpgradeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    fn toggled(self) -> Self {
        match self {
            Self::Auto => Self::Manual,
            Self::Manual => Self::Auto,
        }
    }
}

impl fmt::Display for UpgradeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored maintenance window. Unparseable fields read as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSettings {
    pub start: Option<u32>,
    pub duration: Option<u32>,
    /// When an operator last changed the window.
    pub updated: Option<String>,
}

/// Typed access to operator settings.
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn StateStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn window(&self) -> Result<WindowSettings, StoreError> {
        let key = keys::UPGRADE_WINDOW;
        Ok(WindowSettings {
            start: parse_hours(self.store.get_field(key, "start").await?).filter(|h| *h <= 23),
            duration: parse_hours(self.store.get_field(key, "duration").await?),
            updated: self.store.get_field(key, "update").await?,
        })
    }

    /// Write the default window unless an operator has set one.
    ///
    /// Returns true if the default was written.
    pub async fn ensure_default_window(&self) -> Result<bool, StoreError> {
        let key = keys::UPGRADE_WINDOW;
        if self.store.get_field(key, "update").await?.is_some() {
            return Ok(false);
        }

        let default = MaintenanceWindow::DEFAULT;
        self.store
            .set_field(key, "start", &default.start.to_string())
            .await?;
        self.store
            .set_field(key, "duration", &default.duration.to_string())
            .await?;
        Ok(true)
    }

    /// Validate and store an operator-chosen window.
    pub async fn set_window(
        &self,
        start: u32,
        duration: u32,
    ) -> Result<MaintenanceWindow, CoordinatorError> {
        let window = validate_window(start, duration)?;

        let key = keys::UPGRADE_WINDOW;
        self.store
            .set_field(key, "start", &window.start.to_string())
            .await?;
        self.store
            .set_field(key, "duration", &window.duration.to_string())
            .await?;
        self.store
            .set_field(key, "update", &self.store.now().to_rfc3339())
            .await?;

        info!(start = window.start, duration = window.duration, "Upgrade window updated");
        Ok(window)
    }

    pub async fn strategy(&self) -> Result<UpgradeStrategy, StoreError> {
        let stored = self
            .store
            .get_field(keys::UPGRADE_STRATEGY, "strategy")
            .await?;
        Ok(match stored.as_deref() {
            None | Some("auto") => UpgradeStrategy::Auto,
            Some("manual") => UpgradeStrategy::Manual,
            Some(other) => {
                warn!(strategy = other, "Unrecognized upgrade strategy, treating as manual");
                UpgradeStrategy::Manual
            }
        })
    }

    /// Flip between auto and manual, returning the new strategy.
    pub async fn toggle_strategy(&self) -> Result<UpgradeStrategy, StoreError> {
        let next = self.strategy().await?.toggled();
        let key = keys::UPGRADE_STRATEGY;
        self.store.set_field(key, "strategy", next.as_str()).await?;
        self.store
            .set_field(
                key,
                "desc",
                &format!("{next} set by operator at {}", self.store.now().to_rfc3339()),
            )
            .await?;
        info!(strategy = %next, "Upgrade strategy changed");
        Ok(next)
    }

    /// Read and clear the one-shot force upgrade request.
    pub async fn take_force(&self) -> Result<Option<String>, StoreError> {
        let target = self.store.get_field(keys::FORCE_UPGRADE, "target").await?;
        if target.is_some() {
            self.store.delete_field(keys::FORCE_UPGRADE, "target").await?;
        }
        Ok(target)
    }

    pub async fn set_force(&self, target: &str) -> Result<(), StoreError> {
        self.store
            .set_field(keys::FORCE_UPGRADE, "target", target)
            .await
    }

    pub async fn is_disabled(&self, workload: &str) -> Result<bool, StoreError> {
        let flag = self
            .store
            .get_field(keys::CONTAINER_DISABLED, workload)
            .await?;
        Ok(flag.as_deref() == Some("true"))
    }

    pub async fn set_disabled(&self, workload: &str, disabled: bool) -> Result<(), StoreError> {
        let value = if disabled { "true" } else { "false" };
        self.store
            .set_field(keys::CONTAINER_DISABLED, workload, value)
            .await
    }

    /// Enable `workload` and disable the other members of its exclusion
    /// group.
    ///
    /// Returns the members that were disabled so the caller can remove
    /// their instances.
    pub async fn switch_group(
        &self,
        catalog: &Catalog,
        workload: &str,
    ) -> Result<Vec<&'static str>, CoordinatorError> {
        let spec = catalog
            .get(workload)
            .ok_or_else(|| CoordinatorError::UnknownWorkload(workload.to_string()))?;

        self.set_disabled(spec.name, false).await?;

        let Some(group) = spec.exclusion else {
            return Ok(Vec::new());
        };

        let mut disabled = Vec::new();
        if let Some(members) = catalog.exclusion_groups().get(group.id) {
            for member in members.iter().filter(|m| m.name != spec.name) {
                self.set_disabled(member.name, true).await?;
                disabled.push(member.name);
            }
        }

        info!(enabled = spec.name, disabled = ?disabled, group = group.id, "Switched exclusion group");
        Ok(disabled)
    }
}

fn parse_hours(raw: Option<String>) -> Option<u32> {
    raw.and_then(|v| v.trim().parse().ok())
}
