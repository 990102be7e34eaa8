//! Reconciliation loop for the workload catalog.
//!
//! The reconciler:
//! - Enforces mutual exclusion inside each exclusion group
//! - Starts every enabled workload that is not running
//! - Leaves running and disabled workloads alone
//!
//! It never stops a running workload except to enforce exclusion.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use stack_reconcile::{
    RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RECONCILE_INTERVAL, DEFAULT_RETRY_WINDOW,
};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{Catalog, WorkloadSpec};
use crate::error::CoordinatorError;
use crate::platform::PlatformContext;
use crate::runtime::WorkloadRuntime;
use crate::settings::Settings;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between passes.
    pub interval: Duration,

    /// Consecutive failures before a workload is reported as stuck.
    pub max_retries: u32,

    /// Window for counting failures.
    pub retry_window: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONCILE_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
        }
    }
}

/// What a pass did with one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadAction {
    AlreadyRunning,
    Disabled,
    Started { instance_id: Option<String> },
    /// Not attempted this pass because platform facts are missing.
    Deferred { reason: String },
    Failed { error: String },
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Workloads disabled and removed to enforce exclusion.
    pub excluded: Vec<String>,
    pub workloads: Vec<(String, WorkloadAction)>,
}

impl ReconcileReport {
    pub fn action(&self, name: &str) -> Option<&WorkloadAction> {
        self.workloads
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, action)| action)
    }

    pub fn started(&self) -> Vec<&str> {
        self.workloads
            .iter()
            .filter(|(_, a)| matches!(a, WorkloadAction::Started { .. }))
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// Reconciler for the workload catalog.
pub struct Reconciler {
    catalog: Arc<Catalog>,
    platform: Arc<PlatformContext>,
    settings: Settings,
    runtime: Arc<dyn WorkloadRuntime>,
    retries: Mutex<RetryTracker>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<Catalog>,
        platform: Arc<PlatformContext>,
        settings: Settings,
        runtime: Arc<dyn WorkloadRuntime>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            catalog,
            platform,
            settings,
            runtime,
            retries: Mutex::new(RetryTracker::new(config.max_retries, config.retry_window)),
            config,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            workloads = self.catalog.len(),
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(error = %e, transient = e.is_transient(), "Reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    ///
    /// Store failures abandon the pass. Runtime failures only affect the
    /// workload they belong to.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, CoordinatorError> {
        debug!("Starting reconciliation");

        let mut report = ReconcileReport {
            excluded: self.enforce_exclusion().await?,
            ..Default::default()
        };

        for spec in self.catalog.iter().filter(|s| !s.is_hint()) {
            let action = self.reconcile_workload(spec).await?;
            self.track(spec.name, &action);
            report.workloads.push((spec.name.to_string(), action));
        }

        self.lock_retries().prune();

        let started = report.started();
        if !started.is_empty() || !report.excluded.is_empty() {
            info!(started = ?started, excluded = ?report.excluded, "Reconciliation complete");
        } else {
            debug!("Reconciliation complete, nothing to do");
        }

        Ok(report)
    }

    /// Disable and remove secondary members of every exclusion group unless
    /// someone has already chosen.
    async fn enforce_exclusion(&self) -> Result<Vec<String>, CoordinatorError> {
        let mut excluded = Vec::new();

        for (group, members) in self.catalog.exclusion_groups() {
            let mut chosen = false;
            for member in &members {
                if self.settings.is_disabled(member.name).await? {
                    chosen = true;
                    break;
                }
            }
            if chosen {
                continue;
            }

            for member in members.iter().filter(|m| m.exclusion.is_some_and(|g| !g.primary)) {
                self.settings.set_disabled(member.name, true).await?;
                info!(workload = member.name, group, "Disabled secondary workload");

                if let Err(e) = self.runtime.remove(member.name).await {
                    error!(workload = member.name, group, error = %e, "Failed to remove secondary workload");
                }
                excluded.push(member.name.to_string());
            }
        }

        Ok(excluded)
    }

    async fn reconcile_workload(
        &self,
        spec: &WorkloadSpec,
    ) -> Result<WorkloadAction, CoordinatorError> {
        let name = spec.name;

        let current = match self.runtime.inspect(name).await {
            Ok(current) => current,
            Err(e) => return Ok(self.failed(CoordinatorError::runtime(name, e))),
        };
        if let Some(state) = &current {
            if state.is_running() {
                return Ok(WorkloadAction::AlreadyRunning);
            }
        }

        if self.settings.is_disabled(name).await? {
            debug!(workload = name, "Workload disabled");
            return Ok(WorkloadAction::Disabled);
        }

        let args = match spec.run_args(&self.platform) {
            Ok(args) => args,
            Err(e) => {
                warn!(workload = name, error = %e, "Deferring workload start");
                return Ok(WorkloadAction::Deferred {
                    reason: e.to_string(),
                });
            }
        };

        info!(
            workload = name,
            image = %args.image,
            previous = ?current.as_ref().map(|s| s.lifecycle_state),
            "Starting workload"
        );
        if let Err(e) = self.runtime.start(name, &args).await {
            return Ok(self.failed(CoordinatorError::runtime(name, e)));
        }

        let instance_id = match self.runtime.inspect(name).await {
            Ok(Some(state)) => {
                info!(
                    workload = name,
                    instance_id = %state.instance_id,
                    state = %state.lifecycle_state,
                    status = %state.status_text,
                    "Workload started"
                );
                Some(state.instance_id)
            }
            Ok(None) => {
                warn!(workload = name, "Workload not visible after start");
                None
            }
            Err(e) => {
                warn!(workload = name, error = %e, "Failed to inspect started workload");
                None
            }
        };

        Ok(WorkloadAction::Started { instance_id })
    }

    fn failed(&self, error: CoordinatorError) -> WorkloadAction {
        WorkloadAction::Failed {
            error: error.to_string(),
        }
    }

    /// Record failures and escalate workloads that keep failing.
    fn track(&self, name: &str, action: &WorkloadAction) {
        let mut retries = self.lock_retries();
        match action {
            WorkloadAction::Failed { error } => {
                if retries.record_failure(name) {
                    error!(
                        workload = name,
                        error = %error,
                        attempts = retries.failures(name),
                        "Workload keeps failing"
                    );
                } else {
                    warn!(workload = name, error = %error, attempts = retries.failures(name), "Workload reconcile failed");
                }
            }
            WorkloadAction::Started { .. } | WorkloadAction::AlreadyRunning => retries.clear(name),
            WorkloadAction::Disabled | WorkloadAction::Deferred { .. } => {}
        }
    }

    fn lock_retries(&self) -> std::sync::MutexGuard<'_, RetryTracker> {
        self.retries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
