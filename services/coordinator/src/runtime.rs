//! Workload runtime interface and mock implementation.
//!
//! The runtime interface abstracts the container lifecycle for one named
//! workload instance:
//! - Inspecting the current instance
//! - Starting a new instance from resolved run arguments
//! - Removing an instance (idempotent)
//!
//! The production implementation is the host control client; a mock is
//! provided for tests and development.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::catalog::RunArgs;

/// Container lifecycle state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a runtime state string; unrecognized values map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "created" => Self::Created,
            "running" | "up" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime view of one workload instance. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRuntimeState {
    pub name: String,
    pub instance_id: String,
    pub lifecycle_state: LifecycleState,
    pub status_text: String,
}

impl WorkloadRuntimeState {
    pub fn is_running(&self) -> bool {
        self.lifecycle_state == LifecycleState::Running
    }
}

/// Workload runtime interface.
#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    /// Look up the instance for a workload, if one exists.
    async fn inspect(&self, name: &str) -> Result<Option<WorkloadRuntimeState>>;

    /// Start an instance, replacing any stopped instance with the same name.
    async fn start(&self, name: &str, args: &RunArgs) -> Result<()>;

    /// Remove an instance. Removing an absent instance is not an error.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// A call observed by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Inspect(String),
    Start(String),
    Remove(String),
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    /// Counter for generating instance IDs.
    instance_counter: AtomicU64,

    /// Whether starts should fail.
    fail_starts: bool,

    instances: Mutex<HashMap<String, WorkloadRuntimeState>>,
    calls: Mutex<Vec<RuntimeCall>>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            instance_counter: AtomicU64::new(0),
            fail_starts: false,
            instances: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock runtime that fails all starts.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::new()
        }
    }

    /// Seed an existing instance.
    pub fn with_instance(self, name: &str, state: LifecycleState) -> Self {
        let instance = WorkloadRuntimeState {
            name: name.to_string(),
            instance_id: self.next_instance_id(),
            lifecycle_state: state,
            status_text: state.to_string(),
        };
        lock(&self.instances).insert(name.to_string(), instance);
        self
    }

    /// Simulate an instance exiting on its own.
    pub fn exit(&self, name: &str) {
        if let Some(instance) = lock(&self.instances).get_mut(name) {
            instance.lifecycle_state = LifecycleState::Exited;
            instance.status_text = "Exited (1)".to_string();
        }
    }

    /// All calls observed so far, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.calls).clone()
    }

    /// Number of start calls for a workload.
    pub fn starts(&self, name: &str) -> usize {
        self.count(|c| matches!(c, RuntimeCall::Start(n) if n == name))
    }

    /// Number of remove calls for a workload.
    pub fn removes(&self, name: &str) -> usize {
        self.count(|c| matches!(c, RuntimeCall::Remove(n) if n == name))
    }

    /// Number of start and remove calls across all workloads.
    pub fn mutation_count(&self) -> usize {
        self.count(|c| !matches!(c, RuntimeCall::Inspect(_)))
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn count(&self, pred: impl Fn(&RuntimeCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: RuntimeCall) {
        lock(&self.calls).push(call);
    }

    /// Generate a new instance ID.
    fn next_instance_id(&self) -> String {
        let counter = self.instance_counter.fetch_add(1, Ordering::SeqCst);
        format!("mock_{:012x}", counter)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkloadRuntime for MockRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<WorkloadRuntimeState>> {
        self.record(RuntimeCall::Inspect(name.to_string()));
        Ok(lock(&self.instances).get(name).cloned())
    }

    async fn start(&self, name: &str, args: &RunArgs) -> Result<()> {
        self.record(RuntimeCall::Start(name.to_string()));
        if self.fail_starts {
            anyhow::bail!("Mock runtime configured to fail");
        }

        info!(
            workload = %name,
            image = %args.image,
            "[MOCK] Starting workload"
        );

        let instance = WorkloadRuntimeState {
            name: name.to_string(),
            instance_id: self.next_instance_id(),
            lifecycle_state: LifecycleState::Running,
            status_text: "Up".to_string(),
        };
        debug!(workload = %name, instance_id = %instance.instance_id, "[MOCK] Workload started");
        lock(&self.instances).insert(name.to_string(), instance);

        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.record(RuntimeCall::Remove(name.to_string()));
        if lock(&self.instances).remove(name).is_some() {
            info!(workload = %name, "[MOCK] Workload removed");
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
