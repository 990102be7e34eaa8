//! Stack coordinator
//!
//! Runs the supervised loops of a single stack host:
//!
//! - **Reconciler**: keeps the workload catalog running
//! - **Upgrade coordinator**: checks for releases and upgrades the host
//! - **Secret task**: keeps the platform API secret in place
//! - **Certificate renewal**: asks the host to renew live certificates

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use stack_coordinator::bootstrap::{BootstrapAction, EnsureApiSecret, PrepareHost, RemoveWorkloads};
use stack_coordinator::cert::CertRenewalTask;
use stack_coordinator::client::{HostControlClient, HostRuntime, ReleaseClient, TokenProvider};
use stack_coordinator::config::Config;
use stack_coordinator::secret::{ensure_api_secret, SecretTask, SecretTokenProvider};
use stack_coordinator::settings::Settings;
use stack_coordinator::store::keys;
use stack_coordinator::supervisor::TaskSupervisor;
use stack_coordinator::upgrade::UpgradeConfig;
use stack_coordinator::{
    Catalog, MockRuntime, PlatformContext, Reconciler, ReconcilerConfig, SqliteStore,
    StateStore, UpgradeCoordinator, WorkloadRuntime,
};
use stack_reconcile::RestartPolicy;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Workloads recreated by the bootstrap of this release.
const BOOTSTRAP_REMOVALS: [&str; 4] = ["srs-server", "srs-hooks", "tencent-cloud", "ffmpeg"];

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        data_dir = %config.data_dir.display(),
        release_url = %config.release_url,
        host_url = %config.host_url,
        current_version = %config.current_version,
        dev_mode = config.dev_mode,
        "Starting stack coordinator"
    );

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open(config.state_db_path())?);

    let catalog = Arc::new(Catalog::standard());
    let tokens: Arc<dyn TokenProvider> = Arc::new(SecretTokenProvider::new(store.clone()));
    let host = Arc::new(HostControlClient::new(&config, tokens)?);

    let mut platform = PlatformContext::from_config(&config);
    if platform.host_ipv4.is_none() && !config.dev_mode {
        // Host control calls need the API secret.
        ensure_api_secret(store.as_ref()).await?;
        match host.private_ipv4().await {
            Ok(address) => platform = platform.with_host_ipv4(address),
            Err(e) => warn!(error = %e, "Failed to query host address"),
        }
    }
    let platform = Arc::new(platform);
    let missing = platform.missing_fields();
    if !missing.is_empty() {
        warn!(missing = ?missing, "Platform facts unresolved, dependent workloads will wait");
    }
    if platform.host_ipv4.is_none() {
        warn!("Host address unknown, workloads start without the mgmt host entry");
    }
    ensure_node_id(store.as_ref(), &platform.node_id).await?;
    let releases = Arc::new(ReleaseClient::new(&config)?);

    let runtime: Arc<dyn WorkloadRuntime> = if config.dev_mode {
        info!("Development mode, using mock runtime");
        Arc::new(MockRuntime::new())
    } else {
        Arc::new(HostRuntime::new(host.clone()))
    };

    let reconciler = Arc::new(Reconciler::new(
        catalog,
        platform.clone(),
        Settings::new(store.clone()),
        runtime,
        ReconcilerConfig {
            interval: Duration::from_secs(config.reconcile_interval_secs),
            ..Default::default()
        },
    ));

    let bootstrap_actions: Vec<Arc<dyn BootstrapAction>> = vec![
        Arc::new(PrepareHost::new(host.clone())),
        Arc::new(EnsureApiSecret::new(store.clone())),
        Arc::new(RemoveWorkloads::new(
            host.clone(),
            BOOTSTRAP_REMOVALS.iter().map(|n| n.to_string()).collect(),
        )),
    ];
    let upgrader = Arc::new(
        UpgradeCoordinator::new(
            store.clone(),
            releases,
            host.clone(),
            platform.clone(),
            UpgradeConfig {
                interval: Duration::from_secs(config.upgrade_interval_secs),
                release_tag: config.release_tag.clone(),
                current_version: config.current_version.clone(),
                dev_mode: config.dev_mode,
            },
        )
        .with_bootstrap_actions(bootstrap_actions),
    );

    let secrets = Arc::new(SecretTask::new(
        store.clone(),
        Duration::from_secs(config.secret_interval_secs),
    ));
    let certs = Arc::new(CertRenewalTask::new(
        host,
        platform.work_dir.clone(),
        Duration::from_secs(config.cert_interval_secs),
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisor = TaskSupervisor::new(RestartPolicy::default(), shutdown_rx);

    supervisor.spawn("reconciler", move |shutdown| {
        let reconciler = Arc::clone(&reconciler);
        async move { reconciler.run(shutdown).await }
    });
    supervisor.spawn("upgrade", move |shutdown| {
        let upgrader = Arc::clone(&upgrader);
        async move { upgrader.run(shutdown).await }
    });
    supervisor.spawn("api-secret", move |shutdown| {
        let secrets = Arc::clone(&secrets);
        async move { secrets.run(shutdown).await }
    });
    supervisor.spawn("cert-renewal", move |shutdown| {
        let certs = Arc::clone(&certs);
        async move { certs.run(shutdown).await }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    // Signal shutdown to all loops
    let _ = shutdown_tx.send(true);

    info!("Waiting for loops to shut down...");
    match tokio::time::timeout(Duration::from_secs(10), supervisor.join()).await {
        Ok(states) => info!(states = ?states, "Stack coordinator shutdown complete"),
        Err(_) => error!("Timed out waiting for loops to stop"),
    }

    Ok(())
}

/// Persist the node id so it survives restarts when it was generated.
async fn ensure_node_id(store: &dyn StateStore, node_id: &str) -> Result<()> {
    let created = store
        .compare_and_set(keys::HOST_INFO, "node", None, node_id)
        .await?;
    if created {
        info!(node_id, "Node id recorded");
    }
    Ok(())
}
