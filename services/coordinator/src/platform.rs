//! Host platform facts resolved once at startup.
//!
//! Region, image source, registry and working directory are discovered once
//! and then passed by reference into every component that needs them.
//! Fields stay `None` when discovery could not determine them; consumers
//! must skip work that depends on a missing field rather than guess.

use std::path::PathBuf;

use crate::config::Config;

/// Regions served from the mainland mirror.
const MAINLAND_REGIONS: [&str; 6] = [
    "ap-guangzhou",
    "ap-shanghai",
    "ap-nanjing",
    "ap-beijing",
    "ap-chengdu",
    "ap-chongqing",
];

/// Immutable platform context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformContext {
    pub node_id: String,
    pub cloud: String,
    pub region: Option<String>,
    pub source: Option<String>,
    pub registry: Option<String>,
    pub work_dir: Option<PathBuf>,
    /// Private IPv4 of the host, published to workloads as `mgmt.srs.local`.
    pub host_ipv4: Option<String>,
}

impl PlatformContext {
    /// Build the context from configuration, deriving source and registry
    /// when they were not set explicitly.
    pub fn from_config(config: &Config) -> Self {
        let region = config.region.clone();
        let source = config
            .source
            .clone()
            .or_else(|| region.as_deref().map(|r| discover_source(&config.cloud, r)));
        let registry = config
            .registry
            .clone()
            .or_else(|| source.as_deref().map(discover_registry));

        Self {
            node_id: config.node_id.clone(),
            cloud: config.cloud.clone(),
            region,
            source,
            registry,
            work_dir: config.work_dir.clone(),
            host_ipv4: config.host_ipv4.clone(),
        }
    }

    /// Fill in the host address when configuration did not provide one.
    pub fn with_host_ipv4(mut self, address: Option<String>) -> Self {
        if self.host_ipv4.is_none() {
            self.host_ipv4 = address.filter(|a| !a.is_empty());
        }
        self
    }

    /// Names of the fields that are still unknown.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.region.is_none() {
            missing.push("region");
        }
        if self.source.is_none() {
            missing.push("source");
        }
        if self.registry.is_none() {
            missing.push("registry");
        }
        if self.work_dir.is_none() {
            missing.push("work_dir");
        }
        missing
    }
}

/// Pick the image source for a cloud and region.
pub fn discover_source(cloud: &str, region: &str) -> String {
    match cloud {
        "DEV" | "BT" => return "gitee".to_string(),
        "DO" | "AAPANEL" => return "github".to_string(),
        _ => {}
    }

    if MAINLAND_REGIONS.iter().any(|r| region.starts_with(r)) {
        "gitee".to_string()
    } else {
        "github".to_string()
    }
}

/// Pick the registry for an image source.
pub fn discover_registry(source: &str) -> String {
    if source == "github" {
        "docker.io".to_string()
    } else {
        "registry.cn-hangzhou.aliyuncs.com".to_string()
    }
}
