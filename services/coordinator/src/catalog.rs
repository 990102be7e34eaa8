//! The fixed catalog of workloads this host runs.
//!
//! Specs are immutable once the catalog is built. Image names and volume
//! paths depend on the registry and working directory, so they are resolved
//! against a [`PlatformContext`] only when a workload is about to start.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::platform::PlatformContext;

/// Name workloads use to reach the host control API.
pub const MGMT_HOST: &str = "mgmt.srs.local";

/// Errors resolving a workload spec.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A platform fact the spec depends on is not known yet.
    #[error("workload {workload} needs {field}, which is not resolved yet")]
    Unresolved {
        workload: String,
        field: &'static str,
    },
}

/// Host side of a volume mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPath {
    /// Path relative to the working directory.
    WorkDir(&'static str),
    /// Absolute host path.
    Absolute(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: HostPath,
    pub container: &'static str,
    pub options: Option<&'static str>,
}

impl VolumeMount {
    const fn work_dir(host: &'static str, container: &'static str) -> Self {
        Self {
            host: HostPath::WorkDir(host),
            container,
            options: None,
        }
    }

    fn resolve(&self, work_dir: Option<&Path>) -> Option<String> {
        let host = match &self.host {
            HostPath::WorkDir(rel) => work_dir?.join(rel).display().to_string(),
            HostPath::Absolute(abs) => abs.to_string(),
        };
        Some(match self.options {
            Some(options) => format!("{host}:{}:{options}", self.container),
            None => format!("{host}:{}", self.container),
        })
    }
}

/// Log rotation for a workload's stdout/stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    pub max_size: &'static str,
    pub max_files: u32,
}

/// Membership in a mutual-exclusion group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExclusionGroup {
    pub id: &'static str,
    /// The member kept when nobody has chosen explicitly.
    pub primary: bool,
}

/// One workload in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: &'static str,
    /// Repository and tag below the registry, `None` for externally
    /// managed workloads.
    pub image: Option<&'static str>,
    pub tcp_ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
    pub command: Vec<&'static str>,
    pub volumes: Vec<VolumeMount>,
    pub extras: Vec<&'static str>,
    pub log: Option<LogConfig>,
    pub exclusion: Option<ExclusionGroup>,
}

/// Resolved runtime arguments for starting one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    pub name: String,
    pub image: String,
    /// Full argument vector for the runtime's run operation.
    pub args: Vec<String>,
}

impl WorkloadSpec {
    fn new(name: &'static str, image: Option<&'static str>) -> Self {
        Self {
            name,
            image,
            tcp_ports: Vec::new(),
            udp_ports: Vec::new(),
            command: Vec::new(),
            volumes: Vec::new(),
            extras: Vec::new(),
            log: Some(LogConfig {
                max_size: "1g",
                max_files: 3,
            }),
            exclusion: None,
        }
    }

    /// A spec without an image is managed by someone else.
    pub fn is_hint(&self) -> bool {
        self.image.is_none()
    }

    /// Resolve the full image reference.
    pub fn resolve_image(&self, ctx: &PlatformContext) -> Result<Option<String>, CatalogError> {
        let Some(image) = self.image else {
            return Ok(None);
        };
        let registry = ctx.registry.as_deref().ok_or_else(|| self.unresolved("registry"))?;
        Ok(Some(format!("{registry}/{image}")))
    }

    /// Build the run arguments. Fails if any platform fact is missing.
    pub fn run_args(&self, ctx: &PlatformContext) -> Result<RunArgs, CatalogError> {
        let image = self
            .resolve_image(ctx)?
            .ok_or_else(|| self.unresolved("image"))?;
        let region = ctx.region.as_deref().ok_or_else(|| self.unresolved("region"))?;
        let source = ctx.source.as_deref().ok_or_else(|| self.unresolved("source"))?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--restart=always".into(),
            "--privileged".into(),
            format!("--name={}", self.name),
        ];
        if let Some(address) = &ctx.host_ipv4 {
            args.push(format!("--add-host={MGMT_HOST}:{address}"));
        }

        for port in &self.tcp_ports {
            args.push("-p".into());
            args.push(format!("{port}:{port}/tcp"));
        }
        for port in &self.udp_ports {
            args.push("-p".into());
            args.push(format!("{port}:{port}/udp"));
        }

        if let Some(log) = self.log {
            args.push("--log-driver=json-file".into());
            args.push(format!("--log-opt=max-size={}", log.max_size));
            args.push(format!("--log-opt=max-file={}", log.max_files));
        }

        for volume in &self.volumes {
            let mount = volume
                .resolve(ctx.work_dir.as_deref())
                .ok_or_else(|| self.unresolved("work_dir"))?;
            args.push("-v".into());
            args.push(mount);
        }

        args.extend(self.extras.iter().map(|e| e.to_string()));
        args.push("--env".into());
        args.push(format!("SRS_REGION={region}"));
        args.push("--env".into());
        args.push(format!("SRS_SOURCE={source}"));

        args.push(image.clone());
        args.extend(self.command.iter().map(|c| c.to_string()));

        Ok(RunArgs {
            name: self.name.to_string(),
            image,
            args,
        })
    }

    fn unresolved(&self, field: &'static str) -> CatalogError {
        CatalogError::Unresolved {
            workload: self.name.to_string(),
            field,
        }
    }
}

/// The workload catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    specs: Vec<WorkloadSpec>,
}

impl Catalog {
    /// Build a catalog from specs. Names must be unique and every
    /// exclusion group must have exactly one primary member.
    pub fn new(specs: Vec<WorkloadSpec>) -> Result<Self, String> {
        let mut seen = std::collections::HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name) {
                return Err(format!("duplicate workload name {}", spec.name));
            }
        }

        let catalog = Self { specs };
        for (group, members) in catalog.exclusion_groups() {
            let primaries = members
                .iter()
                .filter(|m| m.exclusion.is_some_and(|g| g.primary))
                .count();
            if primaries != 1 {
                return Err(format!(
                    "exclusion group {group} has {primaries} primary members"
                ));
            }
        }

        Ok(catalog)
    }

    /// The workloads shipped with the stack.
    pub fn standard() -> Self {
        let srs_group = |primary| {
            Some(ExclusionGroup {
                id: "srs",
                primary,
            })
        };
        let srs_volumes = vec![
            VolumeMount::work_dir(
                "containers/conf/srs.release.conf",
                "/usr/local/srs/conf/srs.conf",
            ),
            VolumeMount::work_dir(
                "containers/objs/nginx/html",
                "/usr/local/srs/objs/nginx/html",
            ),
        ];

        let srs = WorkloadSpec {
            tcp_ports: vec![1935, 1985, 8080],
            udp_ports: vec![8000, 10080],
            command: vec!["./objs/srs", "-c", "conf/srs.conf"],
            volumes: srs_volumes.clone(),
            log: Some(LogConfig {
                max_size: "3g",
                max_files: 3,
            }),
            exclusion: srs_group(true),
            ..WorkloadSpec::new("srs-server", Some("ossrs/srs:5"))
        };

        let srs_dev = WorkloadSpec {
            volumes: srs_volumes,
            exclusion: srs_group(false),
            ..WorkloadSpec {
                name: "srs-dev",
                image: Some("ossrs/srs:6"),
                ..srs.clone()
            }
        };

        let hooks = WorkloadSpec {
            tcp_ports: vec![2021],
            command: vec!["node", "."],
            volumes: vec![VolumeMount::work_dir(".env", "/usr/local/srs-stack/hooks/.env")],
            ..WorkloadSpec::new("srs-hooks", Some("ossrs/srs-stack:hooks-1"))
        };

        let tencent = WorkloadSpec {
            tcp_ports: vec![2020],
            command: vec!["node", "."],
            volumes: vec![VolumeMount::work_dir(
                ".env",
                "/usr/local/srs-stack/tencent/.env",
            )],
            ..WorkloadSpec::new("tencent-cloud", Some("ossrs/srs-stack:tencent-1"))
        };

        let ffmpeg = WorkloadSpec {
            tcp_ports: vec![2019],
            command: vec!["node", "."],
            volumes: vec![VolumeMount::work_dir(
                ".env",
                "/usr/local/srs-stack/ffmpeg/.env",
            )],
            ..WorkloadSpec::new("ffmpeg", Some("ossrs/srs-stack:ffmpeg-1"))
        };

        let prometheus = WorkloadSpec {
            tcp_ports: vec![9090],
            command: vec![
                "--storage.tsdb.path=/prometheus",
                "--config.file=/etc/prometheus/prometheus.yml",
                "--web.external-url=http://localhost:9090/prometheus/",
            ],
            volumes: vec![
                VolumeMount::work_dir(
                    "containers/conf/prometheus.yml",
                    "/etc/prometheus/prometheus.yml",
                ),
                VolumeMount::work_dir("containers/data/prometheus", "/prometheus"),
            ],
            extras: vec!["--user=root"],
            ..WorkloadSpec::new("prometheus", Some("ossrs/prometheus"))
        };

        let node_exporter = WorkloadSpec {
            command: vec!["--path.rootfs=/host"],
            volumes: vec![VolumeMount {
                host: HostPath::Absolute("/"),
                container: "/host",
                options: Some("ro,rslave"),
            }],
            extras: vec!["--net=host", "--pid=host"],
            ..WorkloadSpec::new("node-exporter", Some("ossrs/node-exporter"))
        };

        // Managed by the host itself, listed so operators can query it.
        let redis = WorkloadSpec::new("redis", None);

        Self {
            specs: vec![
                srs,
                srs_dev,
                hooks,
                tencent,
                ffmpeg,
                prometheus,
                node_exporter,
                redis,
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&WorkloadSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkloadSpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Exclusion groups by id, members in catalog order.
    pub fn exclusion_groups(&self) -> BTreeMap<&'static str, Vec<&WorkloadSpec>> {
        let mut groups: BTreeMap<&'static str, Vec<&WorkloadSpec>> = BTreeMap::new();
        for spec in &self.specs {
            if let Some(group) = spec.exclusion {
                groups.entry(group.id).or_default().push(spec);
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx() -> PlatformContext {
        PlatformContext {
            node_id: "node-1".to_string(),
            cloud: "DO".to_string(),
            region: Some("sgp1".to_string()),
            source: Some("github".to_string()),
            registry: Some("docker.io".to_string()),
            work_dir: Some(PathBuf::from("/opt/stack")),
            host_ipv4: Some("10.0.0.5".to_string()),
        }
    }

    #[test]
    fn test_standard_catalog_is_valid() {
        let catalog = Catalog::standard();
        assert!(Catalog::new(catalog.iter().cloned().collect()).is_ok());

        let groups = catalog.exclusion_groups();
        let srs: Vec<_> = groups["srs"].iter().map(|s| s.name).collect();
        assert_eq!(srs, vec!["srs-server", "srs-dev"]);

        assert!(catalog.get("redis").unwrap().is_hint());
        assert!(!catalog.get("srs-server").unwrap().is_hint());
    }

    #[test]
    fn test_run_args() {
        let catalog = Catalog::standard();
        let args = catalog.get("srs-server").unwrap().run_args(&ctx()).unwrap();

        assert_eq!(args.image, "docker.io/ossrs/srs:5");
        assert_eq!(
            &args.args[..6],
            [
                "run",
                "-d",
                "--restart=always",
                "--privileged",
                "--name=srs-server",
                "--add-host=mgmt.srs.local:10.0.0.5",
            ]
        );
        assert!(args.args.windows(2).any(|w| w == ["-p", "1935:1935/tcp"]));
        assert!(args.args.windows(2).any(|w| w == ["-p", "10080:10080/udp"]));
        assert!(args.args.contains(&"--log-opt=max-size=3g".to_string()));
        assert!(args.args.windows(2).any(|w| {
            w == [
                "-v",
                "/opt/stack/containers/conf/srs.release.conf:/usr/local/srs/conf/srs.conf",
            ]
        }));
        assert!(args.args.contains(&"SRS_REGION=sgp1".to_string()));

        // Image comes right before the command
        let image_at = args.args.iter().position(|a| a == &args.image).unwrap();
        assert_eq!(&args.args[image_at + 1..], ["./objs/srs", "-c", "conf/srs.conf"]);
    }

    #[test]
    fn test_add_host_only_when_address_known() {
        let catalog = Catalog::standard();
        let mut partial = ctx();
        partial.host_ipv4 = None;

        let args = catalog.get("srs-hooks").unwrap().run_args(&partial).unwrap();
        assert_eq!(args.args[0], "run");
        assert!(!args.args.iter().any(|a| a.starts_with("--add-host")));
    }

    #[test]
    fn test_absolute_volume_with_options() {
        let catalog = Catalog::standard();
        let args = catalog.get("node-exporter").unwrap().run_args(&ctx()).unwrap();
        assert!(args.args.contains(&"/:/host:ro,rslave".to_string()));
    }

    #[test]
    fn test_run_args_needs_platform_facts() {
        let catalog = Catalog::standard();
        let spec = catalog.get("srs-hooks").unwrap();

        let mut partial = ctx();
        partial.registry = None;
        assert!(matches!(
            spec.run_args(&partial),
            Err(CatalogError::Unresolved { field: "registry", .. })
        ));

        let mut partial = ctx();
        partial.work_dir = None;
        assert!(matches!(
            spec.run_args(&partial),
            Err(CatalogError::Unresolved { field: "work_dir", .. })
        ));
    }

    #[test]
    fn test_catalog_rejects_bad_groups() {
        let mut a = WorkloadSpec::new("a", Some("x/a"));
        a.exclusion = Some(ExclusionGroup { id: "g", primary: false });
        let mut b = WorkloadSpec::new("b", Some("x/b"));
        b.exclusion = Some(ExclusionGroup { id: "g", primary: false });
        assert!(Catalog::new(vec![a.clone(), b]).is_err());

        assert!(Catalog::new(vec![a.clone(), a]).is_err());
    }
}
