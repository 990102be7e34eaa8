//! Clients for the remote collaborators.
//!
//! - [`ReleaseClient`]: asks the release service which versions exist
//! - [`HostControlClient`]: privileged operations on the host, authenticated
//!   with a token from a [`TokenProvider`]
//! - [`HostRuntime`]: the workload runtime backed by host control

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::catalog::RunArgs;
use crate::config::Config;
use crate::runtime::{LifecycleState, WorkloadRuntime, WorkloadRuntimeState};

/// Query parameters sent with a release check.
pub type UsageParams = BTreeMap<String, String>;

/// Versions known to the release service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Version the caller reported, echoed back.
    #[serde(rename = "version", default)]
    pub current: String,
    #[serde(default)]
    pub stable: Option<String>,
    #[serde(default)]
    pub latest: Option<String>,
}

impl VersionInfo {
    /// Drop empty strings so absent and blank read the same.
    fn normalized(mut self) -> Self {
        self.stable = self.stable.filter(|s| !s.trim().is_empty());
        self.latest = self.latest.filter(|s| !s.trim().is_empty());
        self
    }

    fn is_empty(&self) -> bool {
        self.stable.is_none() && self.latest.is_none()
    }
}

/// Source of release information.
#[async_trait]
pub trait ReleaseAuthority: Send + Sync {
    /// Returns `None` when the service answered without any version.
    async fn query_latest_version(&self, params: &UsageParams) -> Result<Option<VersionInfo>>;
}

/// Privileged host operations.
#[async_trait]
pub trait HostControl: Send + Sync {
    /// Prepare the host OS for running upgrades.
    async fn prepare_upgrade(&self) -> Result<()>;

    /// Replace the host software with `target`.
    async fn execute_upgrade(&self, target: &str) -> Result<()>;

    /// Remove a workload instance. Absent instances are not an error.
    async fn remove_workload(&self, name: &str) -> Result<()>;

    /// Renew the certificate for a domain.
    async fn renew_certificate(&self, domain: &str) -> Result<()>;
}

/// Supplies the token attached to host control requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// A fixed token.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

fn http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("failed to build HTTP client")
}

/// Release service client.
pub struct ReleaseClient {
    client: reqwest::Client,
    base_url: String,
    current_version: String,
}

impl ReleaseClient {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.release_url.trim_end_matches('/').to_string(),
            current_version: config.current_version.clone(),
        })
    }
}

#[async_trait]
impl ReleaseAuthority for ReleaseClient {
    async fn query_latest_version(&self, params: &UsageParams) -> Result<Option<VersionInfo>> {
        let url = format!("{}/terraform/v1/releases", self.base_url);

        let mut query = params.clone();
        query.insert("version".to_string(), self.current_version.clone());
        query.insert(
            "ts".to_string(),
            chrono::Utc::now().timestamp_millis().to_string(),
        );
        debug!(url = %url, params = ?query, "Querying release service");

        let response = self.client.get(&url).query(&query).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Release query failed");
            anyhow::bail!("Release query failed: {} - {}", status, body);
        }

        let versions = response.json::<VersionInfo>().await?.normalized();
        debug!(
            stable = ?versions.stable,
            latest = ?versions.latest,
            "Release service answered"
        );

        if versions.is_empty() {
            return Ok(None);
        }
        Ok(Some(versions))
    }
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    token: String,
    action: &'a str,
    args: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    #[serde(default)]
    data: Value,
}

/// Host control API client.
pub struct HostControlClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HostControlClient {
    pub fn new(config: &Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.host_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    /// Run one host action and return its `data` payload.
    pub async fn exec(&self, action: &str, args: Vec<Value>) -> Result<Value> {
        let url = format!("{}/terraform/v1/host/exec", self.base_url);
        let request = ExecRequest {
            token: self.tokens.token().await?,
            action,
            args,
        };
        debug!(action, args = ?request.args, "Calling host control");

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(action, status = %status, body = %body, "Host control call failed");
            anyhow::bail!("Host control {} failed: {} - {}", action, status, body);
        }

        let payload: ExecResponse = response.json().await?;
        Ok(payload.data)
    }

    /// Look up the instance named `name`, `None` when it does not exist.
    pub async fn fetch_container(&self, name: &str) -> Result<Option<WorkloadRuntimeState>> {
        let data = self.exec("fetchContainer", vec![json!(name)]).await?;
        let fetched: FetchContainerResponse = if data.is_null() {
            FetchContainerResponse::default()
        } else {
            serde_json::from_value(data)
                .with_context(|| format!("unexpected fetchContainer payload for {name}"))?
        };
        Ok(fetched.into_state(name))
    }

    /// Private IPv4 address the host listens on, if it knows one.
    pub async fn private_ipv4(&self) -> Result<Option<String>> {
        let data = self.exec("ipv4", Vec::new()).await?;
        if data.is_null() {
            return Ok(None);
        }
        let address: HostAddress =
            serde_json::from_value(data).context("unexpected ipv4 payload")?;
        debug!(iface = %address.name, address = %address.address, "Host address resolved");
        Ok(Some(address.address).filter(|a| !a.is_empty() && a != "0.0.0.0"))
    }
}

#[derive(Debug, Deserialize)]
struct HostAddress {
    #[serde(default)]
    name: String,
    #[serde(default)]
    address: String,
}

#[async_trait]
impl HostControl for HostControlClient {
    async fn prepare_upgrade(&self) -> Result<()> {
        self.exec("executeUpgradePrepare", Vec::new()).await?;
        Ok(())
    }

    async fn execute_upgrade(&self, target: &str) -> Result<()> {
        info!(target, "Requesting host upgrade");
        self.exec("execUpgrade", vec![json!(target)]).await?;
        Ok(())
    }

    async fn remove_workload(&self, name: &str) -> Result<()> {
        // The host fails to remove a container that never existed.
        if self.fetch_container(name).await?.is_none() {
            debug!(workload = %name, "No instance to remove");
            return Ok(());
        }
        self.exec("rmContainer", vec![json!(name)]).await?;
        Ok(())
    }

    async fn renew_certificate(&self, domain: &str) -> Result<()> {
        self.exec("updateLetsEncrypt", vec![json!(domain)]).await?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ContainerInfo {
    #[serde(rename = "ID", default)]
    id: Option<String>,
    #[serde(rename = "State", default)]
    state: Option<String>,
    #[serde(rename = "Status", default)]
    status: Option<String>,
}

impl ContainerInfo {
    fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
struct FetchContainerResponse {
    #[serde(default)]
    all: Option<ContainerInfo>,
    #[serde(default)]
    running: Option<ContainerInfo>,
}

impl FetchContainerResponse {
    fn into_state(self, name: &str) -> Option<WorkloadRuntimeState> {
        let all = self.all?;
        let instance_id = all.id()?.to_string();

        let running = self.running.as_ref().and_then(ContainerInfo::id).is_some();
        let lifecycle_state = if running {
            LifecycleState::Running
        } else {
            match all.state.as_deref() {
                // A non-running instance never reports as running.
                Some(state) if LifecycleState::parse(state) != LifecycleState::Running => {
                    LifecycleState::parse(state)
                }
                _ => LifecycleState::Exited,
            }
        };

        Some(WorkloadRuntimeState {
            name: name.to_string(),
            instance_id,
            lifecycle_state,
            status_text: all.status.unwrap_or_default(),
        })
    }
}

/// Workload runtime that drives containers through host control.
pub struct HostRuntime {
    host: Arc<HostControlClient>,
}

impl HostRuntime {
    pub fn new(host: Arc<HostControlClient>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl WorkloadRuntime for HostRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<WorkloadRuntimeState>> {
        self.host.fetch_container(name).await
    }

    async fn start(&self, name: &str, args: &RunArgs) -> Result<()> {
        // The host clears any stopped instance holding the name before it runs.
        self.host
            .exec("startContainer", vec![json!(name), json!(args.args)])
            .await?;
        info!(workload = %name, image = %args.image, "Workload start requested");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.host.remove_workload(name).await
    }
}
