//! Self-upgrade decision loop.
//!
//! Each pass asks the release service for the current stable version and
//! upgrades the host when it is behind, subject to the operator's strategy
//! and maintenance window. A force request bypasses both gates but never
//! the upgrade lock.
//!
//! The lock is only taken around the host upgrade call itself, never across
//! the release query.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Timelike;
use stack_reconcile::window::evaluate;
use stack_reconcile::{less_than, parse_version, WindowDecision, DEFAULT_UPGRADE_INTERVAL};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::bootstrap::{BootstrapAction, BootstrapRunner};
use crate::client::{HostControl, ReleaseAuthority, VersionInfo};
use crate::error::CoordinatorError;
use crate::lock::{LockError, UpgradeLock};
use crate::platform::PlatformContext;
use crate::settings::{Settings, UpgradeStrategy};
use crate::store::StateStore;
use crate::usage::collect_usage_params;

/// Best-effort provisioning of optional cloud services.
#[async_trait]
pub trait OptionalProvisioner: Send + Sync {
    fn name(&self) -> &str;

    async fn provision(&self, platform: &PlatformContext) -> anyhow::Result<()>;
}

/// Upgrade loop configuration.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    pub interval: Duration,

    /// Bootstrap marker for this build.
    pub release_tag: String,

    /// Version of the running software.
    pub current_version: String,

    pub dev_mode: bool,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_UPGRADE_INTERVAL,
            release_tag: "v21".to_string(),
            current_version: format!("v{}", env!("CARGO_PKG_VERSION")),
            dev_mode: false,
        }
    }
}

/// What one upgrade pass decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Release service unreachable or answered without versions.
    NoRelease,
    UpToDate { current: String, stable: Option<String> },
    OutsideWindow(WindowDecision),
    ManualStrategy,
    AlreadyUpgrading { holder: String },
    /// Forced, but no usable target version.
    NoTarget,
    Upgraded { target: String },
    Failed { target: String, error: String },
}

/// Upgrade coordinator.
pub struct UpgradeCoordinator {
    store: Arc<dyn StateStore>,
    settings: Settings,
    lock: UpgradeLock,
    bootstrap: BootstrapRunner,
    bootstrap_actions: Vec<Arc<dyn BootstrapAction>>,
    provisioners: Vec<Arc<dyn OptionalProvisioner>>,
    releases: Arc<dyn ReleaseAuthority>,
    host: Arc<dyn HostControl>,
    platform: Arc<PlatformContext>,
    config: UpgradeConfig,
    first_pass: AtomicBool,
}

impl UpgradeCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        releases: Arc<dyn ReleaseAuthority>,
        host: Arc<dyn HostControl>,
        platform: Arc<PlatformContext>,
        config: UpgradeConfig,
    ) -> Self {
        Self {
            settings: Settings::new(store.clone()),
            lock: UpgradeLock::new(store.clone()),
            bootstrap: BootstrapRunner::new(store.clone()),
            store,
            bootstrap_actions: Vec::new(),
            provisioners: Vec::new(),
            releases,
            host,
            platform,
            config,
            first_pass: AtomicBool::new(true),
        }
    }

    pub fn with_bootstrap_actions(mut self, actions: Vec<Arc<dyn BootstrapAction>>) -> Self {
        self.bootstrap_actions = actions;
        self
    }

    pub fn with_provisioners(mut self, provisioners: Vec<Arc<dyn OptionalProvisioner>>) -> Self {
        self.provisioners = provisioners;
        self
    }

    /// Run the upgrade loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            current_version = %self.config.current_version,
            release_tag = %self.config.release_tag,
            "Starting upgrade loop"
        );

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.upgrade_once().await {
                        Ok(outcome) => debug!(outcome = ?outcome, "Upgrade pass finished"),
                        Err(e) => error!(error = %e, transient = e.is_transient(), "Upgrade pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Upgrade loop shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Perform one upgrade pass.
    #[instrument(skip(self))]
    pub async fn upgrade_once(&self) -> Result<UpgradeOutcome, CoordinatorError> {
        if self.first_pass.load(Ordering::SeqCst) {
            self.lock.reset_on_startup().await?;
            self.first_pass.store(false, Ordering::SeqCst);
        }

        if self.settings.ensure_default_window().await? {
            info!("Default upgrade window written");
        }

        for provisioner in &self.provisioners {
            if let Err(e) = provisioner.provision(&self.platform).await {
                warn!(provisioner = provisioner.name(), error = %e, "Ignoring optional provisioning failure");
            }
        }

        self.bootstrap
            .run_once(&self.config.release_tag, &self.bootstrap_actions)
            .await?;

        let params =
            collect_usage_params(self.store.as_ref(), &self.platform, self.config.dev_mode).await?;
        let versions = match self.releases.query_latest_version(&params).await {
            Ok(Some(versions)) => versions,
            Ok(None) => {
                warn!("Release service returned no versions");
                return Ok(UpgradeOutcome::NoRelease);
            }
            Err(e) => {
                warn!(error = %e, "Release service unreachable");
                return Ok(UpgradeOutcome::NoRelease);
            }
        };

        let force = self.settings.take_force().await?;
        let current = self.config.current_version.as_str();

        let behind = match &versions.stable {
            Some(stable) if force.is_none() => less_than(current, stable)?,
            _ => false,
        };
        info!(
            current,
            stable = ?versions.stable,
            latest = ?versions.latest,
            force = ?force,
            behind,
            "Checked release versions"
        );

        if force.is_none() && !behind {
            return Ok(UpgradeOutcome::UpToDate {
                current: current.to_string(),
                stable: versions.stable,
            });
        }

        let target = match &force {
            Some(requested) => match force_target(requested, &versions) {
                Some(target) => target,
                None => {
                    warn!(requested = %requested, "Forced upgrade has no usable target");
                    return Ok(UpgradeOutcome::NoTarget);
                }
            },
            None => {
                if let Some(outcome) = self.gate().await? {
                    return Ok(outcome);
                }
                // `behind` implies a stable version.
                match versions.stable.clone() {
                    Some(stable) => stable,
                    None => return Ok(UpgradeOutcome::NoTarget),
                }
            }
        };

        self.execute(current, target).await
    }

    /// Window and strategy checks for unforced upgrades.
    async fn gate(&self) -> Result<Option<UpgradeOutcome>, CoordinatorError> {
        let window = self.settings.window().await?;
        let now = self.store.now();
        let decision = evaluate(window.start, window.duration, Some(now.hour()));
        if !decision.allowed {
            info!(
                start = ?decision.start,
                duration = ?decision.duration,
                end = ?decision.end,
                hour = ?decision.hour,
                "Outside upgrade window"
            );
            return Ok(Some(UpgradeOutcome::OutsideWindow(decision)));
        }

        let strategy = self.settings.strategy().await?;
        if strategy != UpgradeStrategy::Auto {
            info!(strategy = %strategy, "Automatic upgrades disabled");
            return Ok(Some(UpgradeOutcome::ManualStrategy));
        }

        Ok(None)
    }

    async fn execute(
        &self,
        current: &str,
        target: String,
    ) -> Result<UpgradeOutcome, CoordinatorError> {
        let description = format!("upgrade from {current} to {target}");

        let result = self
            .lock
            .with_lock(&description, self.host.execute_upgrade(&target))
            .await;

        match result {
            Ok(Ok(())) => {
                info!(target = %target, "Upgrade executed");
                Ok(UpgradeOutcome::Upgraded { target })
            }
            Ok(Err(e)) => {
                error!(target = %target, error = %e, "Upgrade failed");
                Ok(UpgradeOutcome::Failed {
                    target,
                    error: e.to_string(),
                })
            }
            Err(LockError::Held { description }) => {
                info!(holder = %description, "Upgrade already in progress");
                Ok(UpgradeOutcome::AlreadyUpgrading {
                    holder: description,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Target for a forced upgrade: the requested version if it is one,
/// otherwise stable, otherwise latest.
fn force_target(requested: &str, versions: &VersionInfo) -> Option<String> {
    if parse_version(requested).is_ok() {
        return Some(requested.trim().to_string());
    }
    versions.stable.clone().or_else(|| versions.latest.clone())
}
