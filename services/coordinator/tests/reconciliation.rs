//! Integration tests for the reconciliation flow.
//!
//! These tests run full passes of the reconciler against the standard
//! catalog, with MockRuntime standing in for host control.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use stack_coordinator::runtime::{LifecycleState, RuntimeCall};
use stack_coordinator::settings::Settings;
use stack_coordinator::store::keys;
use stack_coordinator::{
    Catalog, MemoryStore, MockRuntime, PlatformContext, Reconciler, ReconcilerConfig,
    SqliteStore, StateStore,
};
use tokio::sync::watch;

fn test_platform() -> PlatformContext {
    PlatformContext {
        node_id: "node-test".to_string(),
        cloud: "DO".to_string(),
        region: Some("sgp1".to_string()),
        source: Some("github".to_string()),
        registry: Some("docker.io".to_string()),
        work_dir: Some(PathBuf::from("/opt/stack")),
        host_ipv4: None,
    }
}

fn test_reconciler(store: Arc<dyn StateStore>, runtime: Arc<MockRuntime>) -> Reconciler {
    Reconciler::new(
        Arc::new(Catalog::standard()),
        Arc::new(test_platform()),
        Settings::new(store),
        runtime,
        ReconcilerConfig::default(),
    )
}

#[tokio::test]
async fn test_exclusion_disables_secondary_once() {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(
        MockRuntime::new()
            .with_instance("srs-server", LifecycleState::Running)
            .with_instance("srs-dev", LifecycleState::Running),
    );
    let reconciler = test_reconciler(store.clone(), runtime.clone());

    reconciler.reconcile_once().await.unwrap();
    reconciler.reconcile_once().await.unwrap();

    assert_eq!(
        store.get_field(keys::CONTAINER_DISABLED, "srs-dev").await.unwrap().as_deref(),
        Some("true")
    );
    assert_eq!(runtime.removes("srs-dev"), 1);

    // Primary untouched.
    assert_eq!(runtime.removes("srs-server"), 0);
    assert_eq!(runtime.starts("srs-server"), 0);
    assert_eq!(
        store.get_field(keys::CONTAINER_DISABLED, "srs-server").await.unwrap(),
        None
    );
}

#[rstest]
#[case::primary_disabled("srs-server", "true")]
#[case::secondary_chosen_elsewhere("srs-dev", "true")]
#[tokio::test]
async fn test_explicit_choice_is_respected(#[case] workload: &str, #[case] flag: &str) {
    let store = Arc::new(MemoryStore::new());
    store
        .set_field(keys::CONTAINER_DISABLED, workload, flag)
        .await
        .unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let reconciler = test_reconciler(store.clone(), runtime.clone());

    let report = reconciler.reconcile_once().await.unwrap();

    assert!(report.excluded.is_empty());
    assert_eq!(runtime.removes("srs-dev"), 0);
    assert_eq!(runtime.removes("srs-server"), 0);
}

#[tokio::test]
async fn test_switch_to_secondary_survives_reconcile() {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(MockRuntime::new());
    let reconciler = test_reconciler(store.clone(), runtime.clone());
    let settings = Settings::new(store.clone());

    reconciler.reconcile_once().await.unwrap();
    assert_eq!(runtime.starts("srs-server"), 1);

    let disabled = settings
        .switch_group(&Catalog::standard(), "srs-dev")
        .await
        .unwrap();
    for name in disabled {
        runtime.exit(name);
    }

    reconciler.reconcile_once().await.unwrap();
    assert_eq!(runtime.starts("srs-dev"), 1);
    assert_eq!(runtime.starts("srs-server"), 1);
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("state.db")).unwrap());
    let runtime = Arc::new(MockRuntime::new());
    let reconciler = test_reconciler(store, runtime.clone());

    reconciler.reconcile_once().await.unwrap();
    assert!(runtime.mutation_count() > 0);

    runtime.clear_calls();
    reconciler.reconcile_once().await.unwrap();

    assert_eq!(runtime.mutation_count(), 0);
    assert!(runtime
        .calls()
        .iter()
        .all(|c| matches!(c, RuntimeCall::Inspect(_))));
}

#[tokio::test]
async fn test_exited_workload_is_restarted() {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(MockRuntime::new());
    let reconciler = test_reconciler(store, runtime.clone());

    reconciler.reconcile_once().await.unwrap();
    runtime.exit("prometheus");

    reconciler.reconcile_once().await.unwrap();
    assert_eq!(runtime.starts("prometheus"), 2);
    assert_eq!(runtime.starts("ffmpeg"), 1);
}

#[tokio::test]
async fn test_reconciler_loop_runs_until_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(MockRuntime::new());
    let reconciler = Reconciler::new(
        Arc::new(Catalog::standard()),
        Arc::new(test_platform()),
        Settings::new(store),
        runtime.clone(),
        ReconcilerConfig {
            interval: Duration::from_millis(10),
            ..Default::default()
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move { reconciler.run(shutdown_rx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    handle.await.unwrap().unwrap();
    assert_eq!(runtime.starts("srs-server"), 1);
}
