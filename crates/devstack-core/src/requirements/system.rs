//! Checks probed directly on the host: privileges, devices, kernel knobs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use devstack_common::constants::{DNS_PLUGIN_PATH, LOOP_CONTROL, SELINUX_MODULE};
use devstack_common::error::Result;

use super::{Check, Requirement, Suggestion};
use crate::exec::Command;
use crate::host::{Host, HostKind};

async fn probe(host: &dyn Host, args: &[&str]) -> Result<bool> {
    Ok(host.run(Command::new(args.iter().copied())).await?.success())
}

/// An SELinux boolean that must be on.
#[derive(Debug)]
pub struct SelinuxBoolean {
    boolean: &'static str,
}

impl SelinuxBoolean {
    /// Requires `boolean` to be enabled.
    pub const fn new(boolean: &'static str) -> Self {
        Self { boolean }
    }
}

#[async_trait]
impl Requirement for SelinuxBoolean {
    fn name(&self) -> &'static str {
        self.boolean
    }

    fn fixable(&self) -> bool {
        true
    }

    async fn check(&self, host: &dyn Host) -> Result<Check> {
        let on = host.selinux_boolean(self.boolean).await.unwrap_or(false);
        Ok(Check::from_bool(on, || {
            Suggestion::new(format!("SELinux boolean '{}' must be enabled.", self.boolean))
                .with_command([
                    "sudo".to_string(),
                    "setsebool".into(),
                    "-P".into(),
                    format!("{}=true", self.boolean),
                ])
        }))
    }
}

/// The engine's DNS plugin must be installed.
#[derive(Debug)]
pub struct DnsPlugin;

#[async_trait]
impl Requirement for DnsPlugin {
    fn name(&self) -> &'static str {
        "dns-plugin"
    }

    async fn check(&self, host: &dyn Host) -> Result<Check> {
        let present = probe(host, &["test", "-x", DNS_PLUGIN_PATH]).await?;
        Ok(Check::from_bool(present, || {
            Suggestion::new("Could not find the podman DNS plugin.")
                .with_command(["dnf", "install", DNS_PLUGIN_PATH])
        }))
    }
}

/// A kernel parameter with a lower bound.
#[derive(Debug)]
pub struct SysctlMinimum {
    parameter: &'static str,
    minimum: u64,
}

impl SysctlMinimum {
    /// Requires `parameter` to be at least `minimum`.
    pub const fn new(parameter: &'static str, minimum: u64) -> Self {
        Self { parameter, minimum }
    }
}

#[async_trait]
impl Requirement for SysctlMinimum {
    fn name(&self) -> &'static str {
        self.parameter
    }

    fn fixable(&self) -> bool {
        true
    }

    async fn check(&self, host: &dyn Host) -> Result<Check> {
        let current = host.sysctl_value(self.parameter).await?;
        Ok(Check::from_bool(current >= self.minimum, || {
            Suggestion::new(format!(
                "sysctl setting {} ({current}) is too low.",
                self.parameter
            ))
            .with_command([
                "sudo".to_string(),
                "sysctl".into(),
                format!("{}={}", self.parameter, self.minimum),
            ])
        }))
    }
}

/// The invoking user must be able to use `sudo`.
#[derive(Debug)]
pub struct HasSudo;

#[async_trait]
impl Requirement for HasSudo {
    fn name(&self) -> &'static str {
        "sudo"
    }

    async fn check(&self, host: &dyn Host) -> Result<Check> {
        let ok = probe(host, &["sudo", "true"]).await?;
        Ok(Check::from_bool(ok, || Suggestion::new("sudo access is required.")))
    }
}

/// The loop device control node must exist.
#[derive(Debug)]
pub struct LoopControlExists;

#[async_trait]
impl Requirement for LoopControlExists {
    fn name(&self) -> &'static str {
        "loop-control"
    }

    fn fixable(&self) -> bool {
        true
    }

    async fn check(&self, host: &dyn Host) -> Result<Check> {
        let exists = host.path_exists(Path::new(LOOP_CONTROL)).await;
        Ok(Check::from_bool(exists, || {
            Suggestion::new(format!("{LOOP_CONTROL} does not exist."))
                .with_command(["sudo", "modprobe", "loop"])
        }))
    }
}

/// The invoking user must be able to write to the loop control node.
///
/// Locally the fix adds the user to the node's group, which only takes
/// effect after logging in again. Inside an engine VM the node's group is
/// changed instead.
#[derive(Debug)]
pub struct LoopControlWritable;

#[async_trait]
impl Requirement for LoopControlWritable {
    fn name(&self) -> &'static str {
        "loop-control-writable"
    }

    fn fixable(&self) -> bool {
        true
    }

    async fn check(&self, host: &dyn Host) -> Result<Check> {
        if probe(host, &["test", "-w", LOOP_CONTROL]).await? {
            return Ok(Check::Pass);
        }
        let user = host.run(Command::new(["whoami"])).await?.check()?;
        let user = user.stdout.trim().to_string();
        let suggestion = Suggestion::new(format!("Cannot write to {LOOP_CONTROL}."));
        let suggestion = if host.kind() == HostKind::Local {
            let group = host
                .run(Command::new(["stat", "--printf", "%G", LOOP_CONTROL]))
                .await?
                .check()?;
            tracing::warn!("group modifications require a logout to take effect");
            suggestion.with_command([
                "sudo".to_string(),
                "usermod".into(),
                "-a".into(),
                "-G".into(),
                group.stdout.trim().to_string(),
                user,
            ])
        } else {
            suggestion.with_command([
                "sudo".to_string(),
                "chgrp".into(),
                user,
                LOOP_CONTROL.into(),
            ])
        };
        Ok(Check::Fail(suggestion))
    }
}

/// The SELinux policy module allowing nested rootless containers.
#[derive(Debug)]
pub struct SelinuxModule {
    source_dir: PathBuf,
}

impl SelinuxModule {
    /// `source_dir` holds `ceph_devstack.te` and possibly a prebuilt `.pp`.
    pub fn new(source_dir: &Path) -> Self {
        Self {
            source_dir: source_dir.to_path_buf(),
        }
    }

    async fn remediation(&self, host: &dyn Host) -> Vec<String> {
        let prebuilt = self.source_dir.join(format!("{SELINUX_MODULE}.pp"));
        if host.path_exists(&prebuilt).await {
            return vec![
                "sudo".into(),
                "semodule".into(),
                "-i".into(),
                prebuilt.display().to_string(),
            ];
        }
        let script = format!(
            "sudo dnf install -y policycoreutils-devel selinux-policy-devel && cd {} && \
             make -f /usr/share/selinux/devel/Makefile {SELINUX_MODULE}.pp && \
             sudo semodule -i {SELINUX_MODULE}.pp",
            self.source_dir.display()
        );
        vec!["sh".into(), "-c".into(), script]
    }
}

#[async_trait]
impl Requirement for SelinuxModule {
    fn name(&self) -> &'static str {
        "selinux-module"
    }

    fn fixable(&self) -> bool {
        true
    }

    async fn check(&self, host: &dyn Host) -> Result<Check> {
        let output = host
            .run(Command::new(["sudo", "semodule", "-l"]))
            .await?;
        if output.stdout.lines().any(|l| l.trim() == SELINUX_MODULE) {
            return Ok(Check::Pass);
        }
        Ok(Check::Fail(
            Suggestion::new(
                "SELinux is in Enforcing mode. To run nested rootless podman containers, \
                 it is necessary to install ceph-devstack's SELinux module.",
            )
            .with_command(self.remediation(host).await),
        ))
    }
}
