//! Certificate renewal trigger.
//!
//! Renewal itself happens on the host. This task only finds domains that
//! have a live certificate directory and asks host control to renew each.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::client::HostControl;

/// Live certificate directory below the working directory.
pub fn live_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("containers/etc/letsencrypt/live")
}

/// Domains with a live certificate directory, sorted.
///
/// A missing live directory means nothing has been issued yet.
pub async fn live_domains(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut domains = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            domains.push(name.to_string());
        }
    }
    domains.sort();
    Ok(domains)
}

/// Outcome of one renewal pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenewalReport {
    pub renewed: Vec<String>,
    pub failed: Vec<String>,
}

/// Periodic certificate renewal.
pub struct CertRenewalTask {
    host: Arc<dyn HostControl>,
    work_dir: Option<PathBuf>,
    interval: Duration,
}

impl CertRenewalTask {
    pub fn new(host: Arc<dyn HostControl>, work_dir: Option<PathBuf>, interval: Duration) -> Self {
        Self {
            host,
            work_dir,
            interval,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "Starting certificate renewal task");

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.renew_once().await {
                        error!(error = %e, "Certificate renewal pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Certificate renewal task shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Renew every live domain once.
    #[instrument(skip(self))]
    pub async fn renew_once(&self) -> std::io::Result<RenewalReport> {
        let Some(work_dir) = &self.work_dir else {
            debug!("No working directory, skipping certificate renewal");
            return Ok(RenewalReport::default());
        };

        let domains = live_domains(&live_dir(work_dir)).await?;
        if domains.is_empty() {
            debug!("No live certificates");
            return Ok(RenewalReport::default());
        }

        let mut report = RenewalReport::default();
        for domain in domains {
            match self.host.renew_certificate(&domain).await {
                Ok(()) => {
                    info!(domain = %domain, "Certificate renewal requested");
                    report.renewed.push(domain);
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Certificate renewal failed");
                    report.failed.push(domain);
                }
            }
        }
        Ok(report)
    }
}
