//! Configuration model for ceph-devstack.
//!
//! A [`DevstackConfig`] is built exactly once per process: the built-in
//! defaults are deep-merged with an optional YAML file, then command-line
//! overrides produce a new value. After that it is shared read-only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::constants;
use crate::error::{DevstackError, Result};
use crate::types::ServiceKind;

/// Where engine commands execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMode {
    /// Local on Linux, tunnelled into the engine VM elsewhere.
    #[default]
    Auto,
    /// Run everything directly on this machine.
    Local,
    /// Tunnel non-engine commands into the engine's managed VM.
    Remote,
}

/// Per-service settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Image reference.
    pub image: Option<String>,
    /// Local source repository; when set the image is built instead of pulled.
    pub repo: Option<PathBuf>,
    /// Desired replica count. Zero removes the service from the topology.
    pub count: Option<u32>,
    /// Loop devices attached to each replica.
    pub loop_device_count: Option<u32>,
    /// Size of each loop device's backing file, in GiB.
    pub loop_device_size_gb: Option<u64>,
}

/// Settings for the requirement evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequirementsConfig {
    /// Require the SELinux policy module when SELinux is enforcing.
    pub selinux_module: bool,
}

impl Default for RequirementsConfig {
    fn default() -> Self {
        Self {
            selinux_module: true,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevstackConfig {
    /// Root for disk images and the test archive.
    pub data_dir: PathBuf,
    /// Checkout holding container definitions and the SELinux policy.
    pub source_dir: PathBuf,
    /// Container engine binary.
    pub engine: String,
    /// Local or tunnelled execution.
    pub host: HostMode,
    /// Prefix used to tunnel commands into the engine VM.
    pub tunnel_prefix: Vec<String>,
    /// Print commands instead of running them.
    pub dry_run: bool,
    /// Existing private key to register instead of generating one.
    pub ssh_privkey_path: Option<PathBuf>,
    /// Upper bound on waiting for a container to report healthy.
    pub health_timeout_secs: u64,
    /// Delay between health probes.
    pub health_interval_secs: u64,
    /// Delay between watch loop passes.
    pub watch_interval_secs: u64,
    /// Requirement evaluator settings.
    pub requirements: RequirementsConfig,
    /// Per-service settings keyed by service base name.
    pub containers: BTreeMap<String, ServiceConfig>,
}

impl Default for DevstackConfig {
    fn default() -> Self {
        let containers = ServiceKind::ALL
            .into_iter()
            .map(|kind| (kind.base_name().to_string(), default_service(kind)))
            .collect();
        Self {
            data_dir: PathBuf::from(constants::DEFAULT_DATA_DIR),
            source_dir: PathBuf::from("."),
            engine: constants::DEFAULT_ENGINE.to_string(),
            host: HostMode::Auto,
            tunnel_prefix: constants::DEFAULT_TUNNEL_PREFIX
                .iter()
                .map(ToString::to_string)
                .collect(),
            dry_run: false,
            ssh_privkey_path: None,
            health_timeout_secs: 600,
            health_interval_secs: 1,
            watch_interval_secs: 10,
            requirements: RequirementsConfig::default(),
            containers,
        }
    }
}

fn default_service(kind: ServiceKind) -> ServiceConfig {
    let image = match kind {
        ServiceKind::Postgres => "docker.io/library/postgres:14",
        ServiceKind::Paddles => "quay.io/ceph-infra/paddles:latest",
        ServiceKind::Beanstalk => "quay.io/ceph-infra/teuthology-beanstalkd:latest",
        ServiceKind::Pulpito => "quay.io/ceph-infra/pulpito:latest",
        ServiceKind::Teuthology => "quay.io/ceph-infra/teuthology-dev:latest",
        ServiceKind::TestNode => "quay.io/ceph-infra/teuthology-testnode:latest",
        ServiceKind::Archive => "docker.io/library/httpd:2.4",
    };
    let mut service = ServiceConfig {
        image: Some(image.to_string()),
        count: Some(1),
        ..ServiceConfig::default()
    };
    if kind == ServiceKind::TestNode {
        service.count = Some(3);
        service.loop_device_count = Some(1);
        service.loop_device_size_gb = Some(5);
    }
    service
}

/// Values supplied on the command line that take precedence over files.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Replacement data directory.
    pub data_dir: Option<PathBuf>,
    /// Force dry-run mode.
    pub dry_run: bool,
    /// Replacement test-node count.
    pub testnode_count: Option<u32>,
}

impl DevstackConfig {
    /// Loads configuration, merging a YAML file over the defaults.
    ///
    /// An explicit `path` must exist. Without one, the default user config
    /// file is used when present. A leading `~` in configured paths is
    /// expanded.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not match the
    /// configuration schema.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => constants::default_config_path().filter(|p| p.exists()),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(&path).map_err(|e| DevstackError::io(&path, e))?;
        let home = std::env::var_os("HOME").map(PathBuf::from);
        Ok(Self::from_yaml_str(&content)?.with_home(home.as_deref()))
    }

    /// Parses YAML and merges it over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed YAML or schema mismatch.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut base = serde_yaml::to_value(Self::default())?;
        let overlay: Value = serde_yaml::from_str(content)?;
        merge(&mut base, overlay);
        Ok(serde_yaml::from_value(base)?)
    }

    /// Replaces a leading `~` in every configured path with `home`.
    #[must_use]
    pub fn with_home(mut self, home: Option<&Path>) -> Self {
        let Some(home) = home else {
            return self;
        };
        self.data_dir = expand_home(&self.data_dir, home);
        self.source_dir = expand_home(&self.source_dir, home);
        if let Some(key) = &self.ssh_privkey_path {
            self.ssh_privkey_path = Some(expand_home(key, home));
        }
        for service in self.containers.values_mut() {
            if let Some(repo) = &service.repo {
                service.repo = Some(expand_home(repo, home));
            }
        }
        self
    }

    /// Returns a new configuration with command-line overrides applied.
    #[must_use]
    pub fn with_overrides(&self, overrides: &Overrides) -> Self {
        let mut merged = self.clone();
        if let Some(dir) = &overrides.data_dir {
            merged.data_dir.clone_from(dir);
        }
        merged.dry_run |= overrides.dry_run;
        if let Some(count) = overrides.testnode_count {
            merged
                .containers
                .entry(ServiceKind::TestNode.base_name().to_string())
                .or_default()
                .count = Some(count);
        }
        merged
    }

    /// Settings for one service, falling back to the built-in defaults for
    /// any field the user left unset.
    pub fn service(&self, kind: ServiceKind) -> ServiceConfig {
        let defaults = default_service(kind);
        let user = self
            .containers
            .get(kind.base_name())
            .cloned()
            .unwrap_or_default();
        ServiceConfig {
            image: user.image.or(defaults.image),
            repo: user.repo.or(defaults.repo),
            count: user.count.or(defaults.count),
            loop_device_count: user.loop_device_count.or(defaults.loop_device_count),
            loop_device_size_gb: user.loop_device_size_gb.or(defaults.loop_device_size_gb),
        }
    }

    /// Directory the orchestrator archives job logs into.
    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("archive")
    }

    /// Directory holding loop device backing files.
    pub fn disk_image_dir(&self) -> PathBuf {
        self.data_dir.join("disk_images")
    }

    /// Bound on health polling.
    pub const fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    /// Spacing between health probes.
    pub const fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Spacing between watch loop passes.
    pub const fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }

    /// Serializes the effective configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                if let Some(slot) = base.get_mut(&key) {
                    merge(slot, value);
                } else {
                    let _ = base.insert(key, value);
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
