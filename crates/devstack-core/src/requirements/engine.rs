//! Checks judged from the engine's own view of the host.

use std::path::Path;

use async_trait::async_trait;
use devstack_common::error::Result;

use super::{Check, Requirement, Suggestion};
use crate::exec::Command;
use crate::host::{EngineInfo, Host};
use crate::version::Version;

const OVERLAY_KERNEL: Version = Version::new(5, 12, 0);
const OVERLAY_ENGINE: Version = Version::new(3, 1, 0);
const CGROUP_V2_KERNEL: Version = Version::new(4, 15, 0);

/// Whether rootless native overlayfs is available. Unknown versions count
/// as too old.
pub fn supports_native_overlay(kernel: Option<Version>, engine: Option<Version>) -> bool {
    let kernel_ok = kernel.is_some_and(|v| v >= OVERLAY_KERNEL);
    let engine_ok = engine.is_some_and(|v| v >= OVERLAY_ENGINE);
    if !kernel_ok {
        tracing::warn!(
            kernel = %kernel.map_or_else(|| "unknown".into(), |v| v.to_string()),
            "kernel is too old to support native rootless overlayfs (needs {OVERLAY_KERNEL})"
        );
    }
    if !engine_ok {
        tracing::warn!(
            engine = %engine.map_or_else(|| "unknown".into(), |v| v.to_string()),
            "engine is too old for rootless native overlayfs (needs {OVERLAY_ENGINE})"
        );
    }
    kernel_ok && engine_ok
}

/// The engine must run containers on Linux, directly or inside its VM.
#[derive(Debug)]
pub struct LinuxPlatform {
    os: String,
    bridged: bool,
}

impl LinuxPlatform {
    /// `bridged` is set when commands are tunnelled into an engine VM.
    pub fn new(info: &EngineInfo, bridged: bool) -> Self {
        Self {
            os: info.host.os.clone(),
            bridged,
        }
    }
}

#[async_trait]
impl Requirement for LinuxPlatform {
    fn name(&self) -> &'static str {
        "platform"
    }

    async fn check(&self, _host: &dyn Host) -> Result<Check> {
        let linux = self.os.eq_ignore_ascii_case("linux");
        Ok(Check::from_bool(linux || self.bridged, || {
            Suggestion::new(format!(
                "Support is currently limited to Linux (engine reports '{}').",
                self.os
            ))
        }))
    }
}

/// The storage driver must be `overlay`.
#[derive(Debug)]
pub struct OverlayStorage {
    driver: String,
    config_file: String,
}

impl OverlayStorage {
    /// Reads the driver from engine facts.
    pub fn new(info: &EngineInfo) -> Self {
        Self {
            driver: info.store.graph_driver_name.clone(),
            config_file: info.store.config_file.clone(),
        }
    }
}

#[async_trait]
impl Requirement for OverlayStorage {
    fn name(&self) -> &'static str {
        "storage-driver"
    }

    async fn check(&self, _host: &dyn Host) -> Result<Check> {
        Ok(Check::from_bool(self.driver == "overlay", || {
            Suggestion::new(format!(
                "The configured graph driver is '{}'. It must be set to 'overlay' in {}.",
                self.driver, self.config_file
            ))
        }))
    }
}

/// Without native overlay support, `fuse-overlayfs` must be installed.
#[derive(Debug)]
pub struct FuseOverlay {
    native: bool,
}

impl FuseOverlay {
    /// `native` is the result of [`supports_native_overlay`].
    pub const fn new(native: bool) -> Self {
        Self { native }
    }
}

#[async_trait]
impl Requirement for FuseOverlay {
    fn name(&self) -> &'static str {
        "fuse-overlayfs"
    }

    async fn check(&self, host: &dyn Host) -> Result<Check> {
        if self.native {
            return Ok(Check::Pass);
        }
        let output = host
            .run(Command::new(["sh", "-c", "command -v fuse-overlayfs"]))
            .await?;
        Ok(Check::from_bool(output.success(), || {
            Suggestion::new("Could not find fuse-overlayfs.")
                .with_command(["dnf", "install", "fuse-overlayfs"])
        }))
    }
}

/// cgroup v2 must be enabled.
#[derive(Debug)]
pub struct CgroupV2 {
    version: String,
    kernel: Option<Version>,
}

impl CgroupV2 {
    /// Reads the cgroup version from engine facts.
    pub fn new(info: &EngineInfo, kernel: Option<Version>) -> Self {
        Self {
            version: info.host.cgroup_version.clone(),
            kernel,
        }
    }
}

#[async_trait]
impl Requirement for CgroupV2 {
    fn name(&self) -> &'static str {
        "cgroup-v2"
    }

    async fn check(&self, _host: &dyn Host) -> Result<Check> {
        if self.version == "v2" {
            return Ok(Check::Pass);
        }
        if let Some(kernel) = self.kernel.filter(|k| *k < CGROUP_V2_KERNEL) {
            return Ok(Check::Fail(Suggestion::new(format!(
                "Kernel version ({kernel}) is too old to support cgroup v2 (needs {CGROUP_V2_KERNEL})."
            ))));
        }
        Ok(Check::Fail(
            Suggestion::new("cgroup v2 is not enabled.").with_command([
                "grubby",
                "--update-kernel=ALL",
                "--args='systemd.unified_cgroup_hierarchy=1'",
            ]),
        ))
    }
}

/// The OCI runtime must be `crun`.
#[derive(Debug)]
pub struct OciRuntime {
    runtime: String,
    containers_conf: String,
}

impl OciRuntime {
    /// Reads the runtime from engine facts. `containers.conf` is expected
    /// next to the storage config.
    pub fn new(info: &EngineInfo) -> Self {
        let containers_conf = Path::new(&info.store.config_file)
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join("containers.conf");
        Self {
            runtime: info.host.oci_runtime.name.clone(),
            containers_conf: containers_conf.display().to_string(),
        }
    }
}

#[async_trait]
impl Requirement for OciRuntime {
    fn name(&self) -> &'static str {
        "oci-runtime"
    }

    async fn check(&self, _host: &dyn Host) -> Result<Check> {
        Ok(Check::from_bool(self.runtime == "crun", || {
            Suggestion::new(format!(
                "The configured runtime is '{}'. It must be set to 'crun' in {}. Afterward, run 'podman system reset'.",
                self.runtime, self.containers_conf
            ))
        }))
    }
}
