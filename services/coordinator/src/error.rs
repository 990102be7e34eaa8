//! Error types for the coordinator.

use stack_reconcile::ReconcileError;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::lock::LockError;
use crate::store::StoreError;

/// Errors surfaced by coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// State store failure; the current iteration is abandoned.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Upgrade lock failure other than a benign conflict.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A workload spec could not be resolved.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Operator input rejected before anything was written.
    #[error("validation failed: {0}")]
    Validation(#[from] ReconcileError),

    /// Unknown workload name.
    #[error("unknown workload: {0}")]
    UnknownWorkload(String),

    /// Workload runtime call failed.
    #[error("runtime error for {workload}: {source}")]
    Runtime {
        workload: String,
        #[source]
        source: anyhow::Error,
    },

    /// Host control call failed.
    #[error("host control {action} failed: {source}")]
    HostControl {
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl CoordinatorError {
    /// Wrap a runtime adapter failure.
    pub fn runtime(workload: &str, source: anyhow::Error) -> Self {
        Self::Runtime {
            workload: workload.to_string(),
            source,
        }
    }

    /// Returns true if the failure is expected to clear on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Unavailable(_))
                | Self::Runtime { .. }
                | Self::HostControl { .. }
        )
    }
}
