//! Host abstraction: where commands run and what the machine looks like.
//!
//! Two variants exist. [`LocalHost`] runs argv directly. [`RemoteHost`] is
//! used when the engine lives in a managed VM (macOS, Windows); every
//! command that is not itself an engine invocation is tunnelled through a
//! prefix such as `podman machine ssh --`.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use devstack_common::config::HostMode;
use devstack_common::error::{DevstackError, Result};
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::exec::{Command, CommandOutput, CommandRunner, RunningProcess};
use crate::version::Version;

/// Which variant a [`Host`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    /// Commands run on this machine.
    Local,
    /// Commands are tunnelled into the engine VM.
    Remote,
}

/// Subset of `<engine> info --format json` the tool relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineInfo {
    /// Facts about the machine running containers.
    pub host: EngineHost,
    /// Storage configuration.
    pub store: EngineStore,
    /// Engine version block.
    pub version: EngineVersion,
}

/// `host` block of engine info.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineHost {
    /// Operating system, e.g. `linux`.
    #[serde(alias = "Os")]
    pub os: String,
    /// Kernel release string.
    pub kernel: String,
    /// `v1` or `v2`.
    pub cgroup_version: String,
    /// Configured OCI runtime.
    pub oci_runtime: OciRuntime,
}

/// `host.ociRuntime` block of engine info.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OciRuntime {
    /// Runtime binary name, e.g. `crun`.
    pub name: String,
}

/// `store` block of engine info.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineStore {
    /// Path of the storage configuration file.
    pub config_file: String,
    /// Storage driver, e.g. `overlay`.
    pub graph_driver_name: String,
}

/// `version` block of engine info.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineVersion {
    /// Engine release string.
    #[serde(rename = "Version")]
    pub version: String,
}

impl EngineInfo {
    /// Whether the engine reports a Linux host.
    pub fn is_linux(&self) -> bool {
        self.host.os.eq_ignore_ascii_case("linux")
    }

    /// Parsed engine version, if it is well formed.
    pub fn engine_version(&self) -> Option<Version> {
        self.version.version.parse().ok()
    }

    /// Parsed kernel version as seen by the engine.
    pub fn kernel_version(&self) -> Option<Version> {
        self.host.kernel.parse().ok()
    }
}

/// Per-host memo of expensive queries.
///
/// Values are kept for the lifetime of the host after the first successful
/// query. There is no expiry; use [`Host::refresh_engine_info`] to force a
/// re-read after remediation.
#[derive(Debug, Default)]
pub struct HostCache {
    kernel: OnceCell<Version>,
    engine_info: Mutex<Option<Arc<EngineInfo>>>,
}

impl HostCache {
    fn engine_info(&self) -> Option<Arc<EngineInfo>> {
        self.engine_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_engine_info(&self, info: Arc<EngineInfo>) {
        *self
            .engine_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(info);
    }
}

/// A machine commands can be executed on.
#[async_trait]
pub trait Host: Send + Sync + fmt::Debug {
    /// Which variant this host is.
    fn kind(&self) -> HostKind;

    /// Container engine binary name.
    fn engine(&self) -> &str;

    /// Runner used to execute commands.
    fn runner(&self) -> &dyn CommandRunner;

    /// Memo of host facts.
    fn cache(&self) -> &HostCache;

    /// Rewrites a command for this host before execution.
    fn wrap(&self, command: Command) -> Command {
        command
    }

    /// Whether `path` exists on the host.
    async fn path_exists(&self, path: &Path) -> bool;

    /// Fully-qualified hostname; `localhost` when it cannot be resolved.
    async fn hostname(&self) -> String;

    /// Runs a command to completion without blocking other tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the program is missing or cannot be spawned.
    async fn run(&self, command: Command) -> Result<CommandOutput> {
        self.runner().run(&self.wrap(command)).await
    }

    /// Starts a command and returns a handle to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the program is missing or cannot be spawned.
    fn run_async(&self, command: Command) -> Result<RunningProcess> {
        self.runner().spawn(&self.wrap(command))
    }

    /// Runs a command to completion, blocking the thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the program is missing or cannot be spawned.
    fn run_blocking(&self, command: Command) -> Result<CommandOutput> {
        self.runner().run_blocking(&self.wrap(command))
    }

    /// Kernel release of the host, queried once.
    ///
    /// # Errors
    ///
    /// Returns an error if `uname -r` fails or prints something unparseable.
    async fn kernel_version(&self) -> Result<Version> {
        let version = self
            .cache()
            .kernel
            .get_or_try_init(|| async {
                let output = self.run(Command::new(["uname", "-r"])).await?.check()?;
                output.stdout.parse::<Version>()
            })
            .await?;
        Ok(*version)
    }

    /// Engine facts, queried once.
    ///
    /// # Errors
    ///
    /// Returns `EngineNotFound` if the engine binary is missing, or an error
    /// if the query fails or its output does not parse.
    async fn engine_info(&self) -> Result<Arc<EngineInfo>> {
        if let Some(info) = self.cache().engine_info() {
            return Ok(info);
        }
        self.refresh_engine_info().await
    }

    /// Re-queries engine facts, replacing the memoized value.
    ///
    /// # Errors
    ///
    /// Same as [`Host::engine_info`].
    async fn refresh_engine_info(&self) -> Result<Arc<EngineInfo>> {
        let engine = self.engine().to_string();
        let output = self
            .run(Command::new([engine.as_str(), "info", "--format", "json"]))
            .await
            .map_err(|e| match e {
                DevstackError::CommandNotFound { program } if program == engine => {
                    DevstackError::EngineNotFound { engine: program }
                }
                other => other,
            })?
            .check()?;
        let info: Arc<EngineInfo> = Arc::new(serde_json::from_str(&output.stdout)?);
        self.cache().store_engine_info(Arc::clone(&info));
        Ok(info)
    }

    /// Whether SELinux is present and enforcing.
    async fn selinux_enforcing(&self) -> bool {
        match self
            .run(Command::new(["cat", "/sys/fs/selinux/enforce"]))
            .await
        {
            Ok(output) => output.success() && output.stdout.trim() == "1",
            Err(e) => {
                tracing::debug!(error = %e, "could not read SELinux mode");
                false
            }
        }
    }

    /// Value of an SELinux boolean.
    ///
    /// # Errors
    ///
    /// Returns an error if `getsebool` fails.
    async fn selinux_boolean(&self, name: &str) -> Result<bool> {
        let output = self.run(Command::new(["getsebool", name])).await?.check()?;
        Ok(output.stdout.trim_end().ends_with("--> on"))
    }

    /// Numeric value of a kernel parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if `sysctl` fails or prints a non-number.
    async fn sysctl_value(&self, name: &str) -> Result<u64> {
        let output = self
            .run(Command::new(["sysctl", "-b", name]))
            .await?
            .check()?;
        output
            .stdout
            .trim()
            .parse()
            .map_err(|_| DevstackError::Config {
                message: format!("sysctl {name} is not numeric: {:?}", output.stdout.trim()),
            })
    }
}

/// Runs commands on this machine.
#[derive(Debug)]
pub struct LocalHost {
    runner: Arc<dyn CommandRunner>,
    engine: String,
    cache: HostCache,
}

impl LocalHost {
    /// Creates a local host using `runner` and the given engine binary.
    pub fn new(runner: Arc<dyn CommandRunner>, engine: impl Into<String>) -> Self {
        Self {
            runner,
            engine: engine.into(),
            cache: HostCache::default(),
        }
    }
}

#[async_trait]
impl Host for LocalHost {
    fn kind(&self) -> HostKind {
        HostKind::Local
    }

    fn engine(&self) -> &str {
        &self.engine
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    fn cache(&self) -> &HostCache {
        &self.cache
    }

    async fn path_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn hostname(&self) -> String {
        if let Ok(output) = self.run(Command::new(["hostname", "-f"])).await {
            let fqdn = output.stdout.trim();
            if output.success() && fqdn.contains('.') {
                return fqdn.to_string();
            }
        }
        let Ok(name) = nix::unistd::gethostname() else {
            return "localhost".into();
        };
        let name = name.to_string_lossy().into_owned();
        if name.is_empty() {
            return "localhost".into();
        }
        let resolves = tokio::net::lookup_host((name.as_str(), 0))
            .await
            .is_ok_and(|mut addrs| addrs.next().is_some());
        if resolves {
            name
        } else {
            tracing::debug!(hostname = %name, "hostname does not resolve");
            "localhost".into()
        }
    }
}

/// Runs commands inside the engine's managed VM.
#[derive(Debug)]
pub struct RemoteHost {
    runner: Arc<dyn CommandRunner>,
    engine: String,
    prefix: Vec<String>,
    cache: HostCache,
}

impl RemoteHost {
    /// Creates a tunnelled host. `prefix` is prepended to every command
    /// whose program is not the engine.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        engine: impl Into<String>,
        prefix: Vec<String>,
    ) -> Self {
        Self {
            runner,
            engine: engine.into(),
            prefix,
            cache: HostCache::default(),
        }
    }
}

#[async_trait]
impl Host for RemoteHost {
    fn kind(&self) -> HostKind {
        HostKind::Remote
    }

    fn engine(&self) -> &str {
        &self.engine
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    fn cache(&self) -> &HostCache {
        &self.cache
    }

    fn wrap(&self, command: Command) -> Command {
        if command.program() == self.engine {
            command
        } else {
            command.with_prefix(&self.prefix)
        }
    }

    async fn path_exists(&self, path: &Path) -> bool {
        let path = path.to_string_lossy().into_owned();
        self.run(Command::new(["test", "-e", path.as_str()]))
            .await
            .is_ok_and(|o| o.success())
    }

    async fn hostname(&self) -> String {
        match self.run(Command::new(["hostname"])).await {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                output.stdout.trim().to_string()
            }
            _ => "localhost".into(),
        }
    }
}

/// Builds the host for `mode`. `Auto` tunnels on anything but Linux.
#[must_use]
pub fn connect(
    mode: HostMode,
    runner: Arc<dyn CommandRunner>,
    engine: &str,
    tunnel_prefix: &[String],
) -> Arc<dyn Host> {
    let remote = match mode {
        HostMode::Local => false,
        HostMode::Remote => true,
        HostMode::Auto => !cfg!(target_os = "linux"),
    };
    if remote {
        tracing::debug!(prefix = %tunnel_prefix.join(" "), "tunnelling commands into engine VM");
        Arc::new(RemoteHost::new(runner, engine, tunnel_prefix.to_vec()))
    } else {
        Arc::new(LocalHost::new(runner, engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;

    const INFO: &str = r#"{
        "host": {
            "os": "linux",
            "kernel": "6.8.5-301.fc40.x86_64",
            "cgroupVersion": "v2",
            "ociRuntime": {"name": "crun", "path": "/usr/bin/crun"}
        },
        "store": {"configFile": "/home/u/.config/containers/storage.conf", "graphDriverName": "overlay"},
        "version": {"Version": "5.0.2", "APIVersion": "5.0.2"}
    }"#;

    fn prefix() -> Vec<String> {
        ["podman", "machine", "ssh", "--"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn engine_info_deserializes_relevant_fields() {
        let info: EngineInfo = serde_json::from_str(INFO).unwrap();
        assert!(info.is_linux());
        assert_eq!(info.host.oci_runtime.name, "crun");
        assert_eq!(info.store.graph_driver_name, "overlay");
        assert_eq!(info.engine_version(), Some(Version::new(5, 0, 2)));
        assert_eq!(info.kernel_version(), Some(Version::new(6, 8, 5)));
    }

    #[tokio::test]
    async fn engine_info_is_memoized_until_refresh() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(["podman", "info"], 0, INFO);
        let host = LocalHost::new(runner.clone(), "podman");
        let _ = host.engine_info().await.unwrap();
        let _ = host.engine_info().await.unwrap();
        assert_eq!(runner.count(&["podman", "info"]), 1);
        let _ = host.refresh_engine_info().await.unwrap();
        assert_eq!(runner.count(&["podman", "info"]), 2);
    }

    #[tokio::test]
    async fn kernel_version_is_memoized() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(["uname", "-r"], 0, "5.14.0-427.el9.x86_64\n");
        let host = LocalHost::new(runner.clone(), "podman");
        assert_eq!(host.kernel_version().await.unwrap(), Version::new(5, 14, 0));
        assert_eq!(host.kernel_version().await.unwrap(), Version::new(5, 14, 0));
        assert_eq!(runner.count(&["uname"]), 1);
    }

    #[tokio::test]
    async fn remote_host_prefixes_non_engine_commands() {
        let runner = Arc::new(RecordingRunner::new());
        let host = RemoteHost::new(runner.clone(), "podman", prefix());
        let _ = host.run(Command::new(["uname", "-r"])).await.unwrap();
        let _ = host
            .run(Command::new(["podman", "container", "inspect", "x"]))
            .await
            .unwrap();
        let calls = runner.calls();
        assert_eq!(calls[0], ["podman", "machine", "ssh", "--", "uname", "-r"]);
        assert_eq!(calls[1], ["podman", "container", "inspect", "x"]);
    }

    #[tokio::test]
    async fn remote_path_check_uses_test() {
        let runner = Arc::new(RecordingRunner::new().with_default_code(1));
        runner.respond(
            ["podman", "machine", "ssh", "--", "test", "-e", "/dev/loop-control"],
            0,
            "",
        );
        let host = RemoteHost::new(runner, "podman", prefix());
        assert!(host.path_exists(Path::new("/dev/loop-control")).await);
        assert!(!host.path_exists(Path::new("/nope")).await);
    }

    #[tokio::test]
    async fn remote_hostname_falls_back_to_localhost() {
        let runner = Arc::new(RecordingRunner::new().with_default_code(1));
        let host = RemoteHost::new(runner, "podman", prefix());
        assert_eq!(host.hostname().await, "localhost");
    }

    #[tokio::test]
    async fn local_hostname_prefers_the_canonical_name() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(["hostname", "-f"], 0, "lab1.example.com\n");
        let host = LocalHost::new(runner, "podman");
        assert_eq!(host.hostname().await, "lab1.example.com");
    }

    #[tokio::test]
    async fn local_hostname_is_never_empty() {
        let host = LocalHost::new(Arc::new(RecordingRunner::new()), "podman");
        assert!(!host.hostname().await.is_empty());
    }

    #[tokio::test]
    async fn selinux_helpers_parse_tool_output() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(["cat", "/sys/fs/selinux/enforce"], 0, "1");
        runner.respond(
            ["getsebool", "container_manage_cgroup"],
            0,
            "container_manage_cgroup --> on\n",
        );
        runner.respond(
            ["getsebool", "container_use_devices"],
            0,
            "container_use_devices --> off\n",
        );
        runner.respond(["sysctl", "-b", "kernel.pid_max"], 0, "4194304");
        let host = LocalHost::new(runner, "podman");
        assert!(host.selinux_enforcing().await);
        assert!(host.selinux_boolean("container_manage_cgroup").await.unwrap());
        assert!(!host.selinux_boolean("container_use_devices").await.unwrap());
        assert_eq!(host.sysctl_value("kernel.pid_max").await.unwrap(), 4_194_304);
    }

    #[test]
    fn connect_honours_explicit_mode() {
        let runner: Arc<dyn CommandRunner> = Arc::new(RecordingRunner::new());
        let local = connect(HostMode::Local, Arc::clone(&runner), "podman", &prefix());
        let remote = connect(HostMode::Remote, runner, "podman", &prefix());
        assert_eq!(local.kind(), HostKind::Local);
        assert_eq!(remote.kind(), HostKind::Remote);
    }
}
