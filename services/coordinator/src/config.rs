//! Configuration for the coordinator.
//!
//! Everything is read once at startup from `STACK_*` environment variables.
//! Each recognized variable and its default is listed on [`Config`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier reported to the release service (`STACK_NODE_ID`, random if unset).
    pub node_id: String,

    /// Directory for the state database (`STACK_DATA_DIR`, default `/data/stackd`).
    pub data_dir: PathBuf,

    /// Working directory that workload volumes are relative to
    /// (`STACK_WORK_DIR`, default the process working directory).
    pub work_dir: Option<PathBuf>,

    /// Hosting provider tag (`STACK_CLOUD`, default `DEV`).
    pub cloud: String,

    /// Cloud region (`STACK_REGION`, falls back to `REGION`).
    pub region: Option<String>,

    /// Image source, `github` or `gitee` (`STACK_SOURCE`, derived if unset).
    pub source: Option<String>,

    /// Image registry host (`STACK_REGISTRY`, derived if unset).
    pub registry: Option<String>,

    /// Private IPv4 of the host (`STACK_HOST_IPV4`, asked from host control if unset).
    pub host_ipv4: Option<String>,

    /// Release service base URL (`STACK_RELEASE_URL`).
    pub release_url: String,

    /// Host control API base URL (`STACK_HOST_URL`).
    pub host_url: String,

    /// Bootstrap marker for this build (`STACK_BOOT_RELEASE`, default `v21`).
    pub release_tag: String,

    /// Version of the running software (`STACK_VERSION`, default the crate version).
    pub current_version: String,

    /// Reconciler interval in seconds (`STACK_RECONCILE_INTERVAL`, default 10).
    pub reconcile_interval_secs: u64,

    /// Upgrade check interval in seconds (`STACK_UPGRADE_INTERVAL`, default 3600).
    pub upgrade_interval_secs: u64,

    /// API secret check interval in seconds (`STACK_SECRET_INTERVAL`, default 3600).
    pub secret_interval_secs: u64,

    /// Certificate renewal interval in seconds (`STACK_CERT_INTERVAL`, default 86400).
    pub cert_interval_secs: u64,

    /// Timeout for remote calls in seconds (`STACK_HTTP_TIMEOUT`, default 30).
    pub http_timeout_secs: u64,

    /// Log level (`STACK_LOG_LEVEL`, default `info`).
    pub log_level: String,

    /// Development mode (`STACK_DEV`): local endpoints and a mock runtime.
    pub dev_mode: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let dev_mode = std::env::var("STACK_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let node_id = std::env::var("STACK_NODE_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let data_dir = std::env::var("STACK_DATA_DIR")
            .unwrap_or_else(|_| "/data/stackd".to_string())
            .into();

        let work_dir = std::env::var("STACK_WORK_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok());

        let cloud = std::env::var("STACK_CLOUD").unwrap_or_else(|_| "DEV".to_string());
        let region = optional_env("STACK_REGION").or_else(|| optional_env("REGION"));
        let source = optional_env("STACK_SOURCE");
        let registry = optional_env("STACK_REGISTRY");

        let host_ipv4 = optional_env("STACK_HOST_IPV4");
        if let Some(address) = &host_ipv4 {
            if address.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(ConfigError::Invalid {
                    var: "STACK_HOST_IPV4",
                    value: address.clone(),
                    reason: "not an IPv4 address".to_string(),
                });
            }
        }

        let release_url = std::env::var("STACK_RELEASE_URL").unwrap_or_else(|_| {
            if dev_mode {
                "http://localhost:2022".to_string()
            } else {
                "http://api.ossrs.net".to_string()
            }
        });

        let host_url = std::env::var("STACK_HOST_URL").unwrap_or_else(|_| {
            if dev_mode {
                "http://localhost:2022".to_string()
            } else {
                "http://mgmt.srs.local:2022".to_string()
            }
        });

        let release_tag = std::env::var("STACK_BOOT_RELEASE").unwrap_or_else(|_| "v21".to_string());

        let current_version = std::env::var("STACK_VERSION")
            .unwrap_or_else(|_| format!("v{}", env!("CARGO_PKG_VERSION")));
        if let Err(e) = stack_reconcile::parse_version(&current_version) {
            return Err(ConfigError::Invalid {
                var: "STACK_VERSION",
                value: current_version,
                reason: e.to_string(),
            });
        }

        let config = Self {
            node_id,
            data_dir,
            work_dir,
            cloud,
            region,
            source,
            registry,
            host_ipv4,
            release_url,
            host_url,
            release_tag,
            current_version,
            reconcile_interval_secs: interval_env("STACK_RECONCILE_INTERVAL", 10)?,
            upgrade_interval_secs: interval_env("STACK_UPGRADE_INTERVAL", 3600)?,
            secret_interval_secs: interval_env("STACK_SECRET_INTERVAL", 3600)?,
            cert_interval_secs: interval_env("STACK_CERT_INTERVAL", 24 * 3600)?,
            http_timeout_secs: interval_env("STACK_HTTP_TIMEOUT", 30)?,
            log_level: std::env::var("STACK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dev_mode,
        };

        Ok(config)
    }

    /// Path of the SQLite state database.
    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn optional_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|s| !s.is_empty())
}

/// Parse a positive number of seconds, falling back to `default` when unset.
fn interval_env(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    let Ok(raw) = std::env::var(var) else {
        return Ok(default);
    };
    parse_interval(var, &raw)
}

fn parse_interval(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let secs: u64 = raw.trim().parse().map_err(|_| invalid("not a number"))?;
    if secs == 0 {
        return Err(invalid("must be greater than zero"));
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("STACK_RECONCILE_INTERVAL", "15").unwrap(), 15);
        assert_eq!(parse_interval("STACK_RECONCILE_INTERVAL", " 7 ").unwrap(), 7);
        assert!(parse_interval("STACK_RECONCILE_INTERVAL", "0").is_err());
        assert!(parse_interval("STACK_RECONCILE_INTERVAL", "soon").is_err());
    }

    #[test]
    fn test_state_db_path() {
        let config = Config {
            node_id: "n".to_string(),
            data_dir: PathBuf::from("/var/lib/stackd"),
            work_dir: None,
            cloud: "DEV".to_string(),
            region: None,
            source: None,
            registry: None,
            host_ipv4: None,
            release_url: String::new(),
            host_url: String::new(),
            release_tag: "v21".to_string(),
            current_version: "v1.0.0".to_string(),
            reconcile_interval_secs: 10,
            upgrade_interval_secs: 3600,
            secret_interval_secs: 3600,
            cert_interval_secs: 86400,
            http_timeout_secs: 30,
            log_level: "info".to_string(),
            dev_mode: false,
        };
        assert_eq!(config.state_db_path(), PathBuf::from("/var/lib/stackd/state.db"));
        assert_eq!(config.http_timeout(), Duration::from_secs(30));
    }
}
