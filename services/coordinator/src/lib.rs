//! Stack coordinator library.
//!
//! The coordinator runs on a single stack host. It keeps a fixed catalog of
//! workloads running according to operator choices, and decides when the
//! host software itself should be upgraded.
//!
//! ## Architecture
//!
//! ```text
//! TaskSupervisor
//! ├── Reconciler          (workload convergence, every 10s)
//! ├── UpgradeCoordinator  (release check and self-upgrade, hourly)
//! ├── SecretTask          (platform API secret, hourly)
//! └── CertRenewalTask     (certificate renewal trigger, daily)
//! ```
//!
//! The loops share nothing but the [`store::StateStore`].

pub mod bootstrap;
pub mod catalog;
pub mod cert;
pub mod client;
pub mod config;
pub mod error;
pub mod lock;
pub mod platform;
pub mod reconciler;
pub mod runtime;
pub mod secret;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod upgrade;
pub mod usage;

// Re-export commonly used types
pub use catalog::{Catalog, RunArgs, WorkloadSpec};
pub use error::CoordinatorError;
pub use platform::PlatformContext;
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use runtime::{MockRuntime, WorkloadRuntime};
pub use store::{MemoryStore, SqliteStore, StateStore};
pub use upgrade::{UpgradeCoordinator, UpgradeOutcome};
