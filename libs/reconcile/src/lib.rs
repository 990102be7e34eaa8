//! Reconciliation decision primitives.
//!
//! This library holds the pure, side-effect free pieces used by the stack
//! coordinator's control loops:
//!
//! - **Maintenance windows**: is an hour of the day inside the configured
//!   upgrade window.
//! - **Version ordering**: semantic-version comparison of release tags.
//! - **Backoff**: restart and retry pacing for supervised loops.
//! - **Retry tracking**: per-resource failure counting inside a window.
//!
//! # Invariants
//!
//! - Every function here is deterministic given the same inputs (backoff
//!   jitter aside)
//! - Nothing here touches the state store or the network

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use thiserror::Error;

pub mod backoff;
pub mod version;
pub mod window;

pub use backoff::{BackoffPolicy, RestartPolicy};
pub use version::{less_than, parse_version};
pub use window::{in_window, validate_window, MaintenanceWindow, WindowDecision};

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A version string could not be parsed as semver.
    #[error("invalid version {input:?}: {reason}")]
    InvalidVersion { input: String, reason: String },

    /// A maintenance window was rejected by validation.
    #[error("invalid maintenance window: {0}")]
    InvalidWindow(String),
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Number of failures recorded for a resource in the current window.
    pub fn failures(&self, resource_key: &str) -> u32 {
        match self.failures.get(resource_key) {
            Some((count, first)) if first.elapsed() <= self.window => *count,
            _ => 0,
        }
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        self.failures(resource_key) > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval between upgrade checks.
pub const DEFAULT_UPGRADE_INTERVAL: Duration = Duration::from_secs(3600);

/// Default retry limit per workload before failures are escalated.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
