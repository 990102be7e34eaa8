//! Integration tests for the upgrade decision flow.
//!
//! The release service and host control are replaced by in-process fakes;
//! the store clock is pinned so window checks are deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use stack_coordinator::bootstrap::BootstrapAction;
use stack_coordinator::client::{HostControl, ReleaseAuthority, UsageParams, VersionInfo};
use stack_coordinator::lock::UpgradeLock;
use stack_coordinator::settings::Settings;
use stack_coordinator::store::keys;
use stack_coordinator::upgrade::{OptionalProvisioner, UpgradeConfig};
use stack_coordinator::{
    CoordinatorError, MemoryStore, PlatformContext, StateStore, UpgradeCoordinator,
    UpgradeOutcome,
};

struct FakeReleases {
    answer: Option<VersionInfo>,
    reachable: bool,
    params: Mutex<Vec<UsageParams>>,
}

impl FakeReleases {
    fn stable(stable: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(VersionInfo {
                current: "v5.0.0".to_string(),
                stable: Some(stable.to_string()),
                latest: Some("v6.0.0-alpha.1".to_string()),
            }),
            reachable: true,
            params: Mutex::new(Vec::new()),
        })
    }

    fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            answer: None,
            reachable: false,
            params: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReleaseAuthority for FakeReleases {
    async fn query_latest_version(&self, params: &UsageParams) -> Result<Option<VersionInfo>> {
        self.params.lock().unwrap().push(params.clone());
        if !self.reachable {
            anyhow::bail!("connection refused");
        }
        Ok(self.answer.clone())
    }
}

/// Records upgrades and whether the lock was held while each ran.
struct FakeHost {
    store: Arc<MemoryStore>,
    fail: bool,
    upgrades: Mutex<Vec<(String, bool)>>,
}

impl FakeHost {
    fn new(store: Arc<MemoryStore>, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            store,
            fail,
            upgrades: Mutex::new(Vec::new()),
        })
    }

    fn upgrades(&self) -> Vec<(String, bool)> {
        self.upgrades.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostControl for FakeHost {
    async fn prepare_upgrade(&self) -> Result<()> {
        Ok(())
    }

    async fn execute_upgrade(&self, target: &str) -> Result<()> {
        let held = self
            .store
            .get_field(keys::UPGRADING, "upgrading")
            .await?
            .as_deref()
            == Some("1");
        self.upgrades.lock().unwrap().push((target.to_string(), held));
        if self.fail {
            anyhow::bail!("upgrade script exited with 1");
        }
        Ok(())
    }

    async fn remove_workload(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn renew_certificate(&self, _domain: &str) -> Result<()> {
        Ok(())
    }
}

struct CountingAction(AtomicUsize);

#[async_trait]
impl BootstrapAction for CountingAction {
    fn name(&self) -> &str {
        "counting"
    }

    async fn run(&self) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A provisioner whose cloud API is down.
struct BrokenProvisioner(AtomicUsize);

#[async_trait]
impl OptionalProvisioner for BrokenProvisioner {
    fn name(&self) -> &str {
        "storage-bucket"
    }

    async fn provision(&self, _platform: &PlatformContext) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("cloud API returned 503")
    }
}

/// A time inside the default 23:00 + 6h window.
fn night() -> DateTime<Local> {
    Local.with_ymd_and_hms(2026, 1, 10, 2, 0, 0).single().unwrap()
}

fn noon() -> DateTime<Local> {
    Local.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).single().unwrap()
}

fn coordinator(
    store: Arc<MemoryStore>,
    releases: Arc<FakeReleases>,
    host: Arc<FakeHost>,
) -> UpgradeCoordinator {
    UpgradeCoordinator::new(
        store,
        releases,
        host,
        Arc::new(PlatformContext {
            node_id: "node-test".to_string(),
            cloud: "DEV".to_string(),
            ..Default::default()
        }),
        UpgradeConfig {
            current_version: "v5.0.0".to_string(),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_auto_upgrade_inside_window() {
    let store = Arc::new(MemoryStore::with_clock(night()));
    let host = FakeHost::new(store.clone(), false);
    let coordinator = coordinator(store.clone(), FakeReleases::stable("v5.1.0"), host.clone());

    let outcome = coordinator.upgrade_once().await.unwrap();

    assert_eq!(
        outcome,
        UpgradeOutcome::Upgraded {
            target: "v5.1.0".to_string()
        }
    );
    assert_eq!(host.upgrades(), vec![("v5.1.0".to_string(), true)]);

    let lock = UpgradeLock::new(store.clone());
    assert_eq!(lock.holder().await.unwrap(), None);
}

#[tokio::test]
async fn test_up_to_date_does_nothing() {
    let store = Arc::new(MemoryStore::with_clock(night()));
    let host = FakeHost::new(store.clone(), false);
    let coordinator = coordinator(store.clone(), FakeReleases::stable("v5.0.0"), host.clone());

    let outcome = coordinator.upgrade_once().await.unwrap();

    assert!(matches!(outcome, UpgradeOutcome::UpToDate { .. }));
    assert!(host.upgrades().is_empty());
}

#[tokio::test]
async fn test_manual_strategy_never_touches_lock() {
    let store = Arc::new(MemoryStore::with_clock(night()));
    Settings::new(store.clone()).toggle_strategy().await.unwrap();
    let host = FakeHost::new(store.clone(), false);
    let coordinator = coordinator(store.clone(), FakeReleases::stable("v5.1.0"), host.clone());

    let outcome = coordinator.upgrade_once().await.unwrap();

    assert_eq!(outcome, UpgradeOutcome::ManualStrategy);
    assert!(host.upgrades().is_empty());
    assert_eq!(store.len(keys::UPGRADING).await.unwrap(), 0);
}

#[tokio::test]
async fn test_outside_window_reports_decision() {
    let store = Arc::new(MemoryStore::with_clock(noon()));
    let host = FakeHost::new(store.clone(), false);
    let coordinator = coordinator(store.clone(), FakeReleases::stable("v5.1.0"), host.clone());

    let outcome = coordinator.upgrade_once().await.unwrap();

    match outcome {
        UpgradeOutcome::OutsideWindow(decision) => {
            assert!(!decision.allowed);
            assert_eq!(decision.start, Some(23));
            assert_eq!(decision.end, Some(5));
            assert_eq!(decision.hour, Some(12));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(host.upgrades().is_empty());
}

#[tokio::test]
async fn test_force_bypasses_strategy_and_window() {
    let store = Arc::new(MemoryStore::with_clock(noon()));
    let settings = Settings::new(store.clone());
    settings.toggle_strategy().await.unwrap();
    settings.set_force("v5.2.0").await.unwrap();
    let host = FakeHost::new(store.clone(), false);
    let coordinator = coordinator(store.clone(), FakeReleases::stable("v5.1.0"), host.clone());

    let outcome = coordinator.upgrade_once().await.unwrap();

    assert_eq!(
        outcome,
        UpgradeOutcome::Upgraded {
            target: "v5.2.0".to_string()
        }
    );
    assert_eq!(host.upgrades(), vec![("v5.2.0".to_string(), true)]);
    assert_eq!(settings.take_force().await.unwrap(), None);
}

#[tokio::test]
async fn test_force_without_version_uses_stable() {
    let store = Arc::new(MemoryStore::with_clock(noon()));
    Settings::new(store.clone()).set_force("1").await.unwrap();
    let host = FakeHost::new(store.clone(), false);
    // Already on stable, but forced anyway.
    let coordinator = coordinator(store.clone(), FakeReleases::stable("v5.0.0"), host.clone());

    let outcome = coordinator.upgrade_once().await.unwrap();

    assert_eq!(
        outcome,
        UpgradeOutcome::Upgraded {
            target: "v5.0.0".to_string()
        }
    );
}

#[tokio::test]
async fn test_force_blocked_by_held_lock() {
    let store = Arc::new(MemoryStore::with_clock(noon()));
    let settings = Settings::new(store.clone());
    let host = FakeHost::new(store.clone(), false);
    let coordinator = coordinator(store.clone(), FakeReleases::stable("v5.0.0"), host.clone());

    // First pass clears stale state; the lock taken afterwards is live.
    coordinator.upgrade_once().await.unwrap();
    let lock = UpgradeLock::new(store.clone());
    lock.try_acquire("operator upgrade to v5.0.1").await.unwrap();
    settings.set_force("v5.2.0").await.unwrap();

    let outcome = coordinator.upgrade_once().await.unwrap();

    assert_eq!(
        outcome,
        UpgradeOutcome::AlreadyUpgrading {
            holder: "operator upgrade to v5.0.1".to_string()
        }
    );
    assert!(host.upgrades().is_empty());
    // Consumed even though nothing ran.
    assert_eq!(settings.take_force().await.unwrap(), None);
    assert_eq!(
        lock.holder().await.unwrap().as_deref(),
        Some("operator upgrade to v5.0.1")
    );
}

#[tokio::test]
async fn test_stale_lock_cleared_on_first_pass() {
    let store = Arc::new(MemoryStore::with_clock(night()));
    store.set_field(keys::UPGRADING, "upgrading", "1").await.unwrap();
    store
        .set_field(keys::UPGRADING, "desc", "upgrade interrupted by reboot")
        .await
        .unwrap();
    let host = FakeHost::new(store.clone(), false);
    let coordinator = coordinator(store.clone(), FakeReleases::stable("v5.1.0"), host.clone());

    let outcome = coordinator.upgrade_once().await.unwrap();

    assert!(matches!(outcome, UpgradeOutcome::Upgraded { .. }));
}

#[tokio::test]
async fn test_failed_upgrade_releases_lock() {
    let store = Arc::new(MemoryStore::with_clock(night()));
    let host = FakeHost::new(store.clone(), true);
    let coordinator = coordinator(store.clone(), FakeReleases::stable("v5.1.0"), host.clone());

    let outcome = coordinator.upgrade_once().await.unwrap();

    assert!(matches!(
        outcome,
        UpgradeOutcome::Failed { ref target, .. } if target == "v5.1.0"
    ));
    assert_eq!(UpgradeLock::new(store.clone()).holder().await.unwrap(), None);
}

#[tokio::test]
async fn test_unreachable_release_service_keeps_force() {
    let store = Arc::new(MemoryStore::with_clock(night()));
    let settings = Settings::new(store.clone());
    settings.set_force("v5.2.0").await.unwrap();
    let host = FakeHost::new(store.clone(), false);
    let coordinator = coordinator(store.clone(), FakeReleases::unreachable(), host.clone());

    let outcome = coordinator.upgrade_once().await.unwrap();

    assert_eq!(outcome, UpgradeOutcome::NoRelease);
    assert!(host.upgrades().is_empty());
    assert_eq!(settings.take_force().await.unwrap().as_deref(), Some("v5.2.0"));
}

#[tokio::test]
async fn test_unparseable_stable_is_an_error() {
    let store = Arc::new(MemoryStore::with_clock(night()));
    let host = FakeHost::new(store.clone(), false);
    let coordinator = coordinator(store.clone(), FakeReleases::stable("next"), host.clone());

    let err = coordinator.upgrade_once().await.unwrap_err();

    assert!(matches!(err, CoordinatorError::Validation(_)));
    assert!(host.upgrades().is_empty());
}

#[tokio::test]
async fn test_bootstrap_and_default_window_run_once() {
    let store = Arc::new(MemoryStore::with_clock(noon()));
    let host = FakeHost::new(store.clone(), false);
    let releases = FakeReleases::stable("v5.0.0");
    let action = Arc::new(CountingAction(AtomicUsize::new(0)));
    let coordinator = coordinator(store.clone(), releases.clone(), host)
        .with_bootstrap_actions(vec![action.clone() as Arc<dyn BootstrapAction>]);

    coordinator.upgrade_once().await.unwrap();
    coordinator.upgrade_once().await.unwrap();

    assert_eq!(action.0.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.get_field(keys::FIRST_BOOT, "v21").await.unwrap().as_deref(),
        Some("1")
    );

    let window = Settings::new(store.clone()).window().await.unwrap();
    assert_eq!((window.start, window.duration), (Some(23), Some(6)));

    let params = releases.params.lock().unwrap().clone();
    assert_eq!(params.len(), 2);
    assert_eq!(params[0]["nid"], "node-test");
}

#[tokio::test]
async fn test_failed_provisioning_does_not_block_upgrade() {
    let store = Arc::new(MemoryStore::with_clock(night()));
    let host = FakeHost::new(store.clone(), false);
    let releases = FakeReleases::stable("v5.1.0");
    let provisioner = Arc::new(BrokenProvisioner(AtomicUsize::new(0)));
    let action = Arc::new(CountingAction(AtomicUsize::new(0)));
    let coordinator = coordinator(store.clone(), releases.clone(), host.clone())
        .with_provisioners(vec![provisioner.clone() as Arc<dyn OptionalProvisioner>])
        .with_bootstrap_actions(vec![action.clone() as Arc<dyn BootstrapAction>]);

    let outcome = coordinator.upgrade_once().await.unwrap();

    assert_eq!(
        outcome,
        UpgradeOutcome::Upgraded {
            target: "v5.1.0".to_string()
        }
    );
    assert_eq!(provisioner.0.load(Ordering::SeqCst), 1);
    assert_eq!(action.0.load(Ordering::SeqCst), 1);
    assert_eq!(releases.params.lock().unwrap().len(), 1);
    assert_eq!(host.upgrades(), vec![("v5.1.0".to_string(), true)]);
}
