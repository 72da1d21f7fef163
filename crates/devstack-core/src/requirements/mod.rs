//! Host requirement evaluation.
//!
//! Every topology operation is gated on an ordered chain of checks. A check
//! that fails is reported with a human explanation and, where one exists, a
//! copy-pasteable command. Fixable requirements run that command themselves
//! when remediation is enabled (`doctor --fix`).

mod engine;
mod system;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use devstack_common::config::RequirementsConfig;
use devstack_common::error::{DevstackError, Result};

pub use engine::{
    CgroupV2, FuseOverlay, LinuxPlatform, OciRuntime, OverlayStorage, supports_native_overlay,
};
pub use system::{
    DnsPlugin, HasSudo, LoopControlExists, LoopControlWritable, SelinuxBoolean, SelinuxModule,
    SysctlMinimum,
};

use crate::exec::{Command, CommandOutput};
use crate::host::{Host, HostKind};

/// Explanation attached to a failed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    /// What is wrong.
    pub message: String,
    /// Command that would fix it, if any. Fixable requirements run it.
    pub command: Option<Vec<String>>,
}

impl Suggestion {
    /// A suggestion without a command.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            command: None,
        }
    }

    /// Attaches a remediation command.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }
}

impl fmt::Display for Suggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} Try: {}", self.message, command.join(" ")),
            None => f.write_str(&self.message),
        }
    }
}

/// Result of probing a requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    /// The host satisfies the requirement.
    Pass,
    /// The host does not; here is why.
    Fail(Suggestion),
}

impl Check {
    /// Passes when `ok`, otherwise fails with `suggestion`.
    pub fn from_bool(ok: bool, suggestion: impl FnOnce() -> Suggestion) -> Self {
        if ok { Self::Pass } else { Self::Fail(suggestion()) }
    }
}

/// A named host capability.
#[async_trait]
pub trait Requirement: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Whether the suggestion's command may be run automatically.
    fn fixable(&self) -> bool {
        false
    }

    /// Probes the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe itself cannot run.
    async fn check(&self, host: &dyn Host) -> Result<Check>;
}

/// What happened to one requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The check passed.
    Satisfied,
    /// The check failed and nothing was attempted.
    Unsatisfied,
    /// The check failed and remediation succeeded.
    Fixed,
    /// The check failed and remediation failed.
    FixFailed,
}

impl Outcome {
    /// Whether this outcome counts towards a passing report.
    pub const fn passed(self) -> bool {
        matches!(self, Self::Satisfied | Self::Fixed)
    }
}

/// Evaluates one requirement, running its fix when permitted.
pub async fn evaluate(requirement: &dyn Requirement, host: &dyn Host, fix: bool) -> Outcome {
    let name = requirement.name();
    let suggestion = match requirement.check(host).await {
        Ok(Check::Pass) => {
            tracing::debug!(requirement = name, "satisfied");
            return Outcome::Satisfied;
        }
        Ok(Check::Fail(suggestion)) => suggestion,
        Err(e) => Suggestion::new(format!("Could not evaluate: {e}")),
    };
    let remediation = suggestion
        .command
        .as_ref()
        .filter(|_| fix && requirement.fixable());
    let Some(command) = remediation else {
        tracing::error!(requirement = name, "{suggestion}");
        return Outcome::Unsatisfied;
    };
    tracing::info!(requirement = name, command = %command.join(" "), "applying fix");
    match host
        .run(Command::new(command.clone()).stream_output(name))
        .await
        .and_then(CommandOutput::check)
    {
        Ok(_) => Outcome::Fixed,
        Err(e) => {
            tracing::error!(requirement = name, error = %e, "fix failed; {}", suggestion.message);
            Outcome::FixFailed
        }
    }
}

/// Outcome of one entry in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementResult {
    /// Requirement name.
    pub name: &'static str,
    /// What happened.
    pub outcome: Outcome,
}

/// Aggregate result of the requirement chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    /// Every evaluated requirement, in order.
    pub results: Vec<RequirementResult>,
    /// Whether the engine can use native rootless overlayfs.
    pub native_overlay: bool,
}

impl Report {
    /// Strict AND over every evaluated requirement.
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.outcome.passed())
    }

    fn record(&mut self, name: &'static str, outcome: Outcome) -> bool {
        self.results.push(RequirementResult { name, outcome });
        outcome.passed()
    }

    async fn step(&mut self, requirement: &dyn Requirement, host: &dyn Host, fix: bool) -> bool {
        let outcome = evaluate(requirement, host, fix).await;
        self.record(requirement.name(), outcome)
    }
}

/// Runs the full requirement chain against `host`.
///
/// Checks that presuppose an earlier failure are skipped: without engine
/// facts nothing else can be judged, a non-Linux engine host without a VM
/// bridge ends the chain, and write access to the loop control node is only
/// checked once the node exists.
pub async fn check_requirements(
    host: &dyn Host,
    config: &RequirementsConfig,
    source_dir: &Path,
    fix: bool,
) -> Report {
    let mut report = Report::default();

    let info = match host.engine_info().await {
        Ok(info) => info,
        Err(e) => {
            match &e {
                DevstackError::EngineNotFound { .. } => tracing::error!("{e}"),
                other => tracing::error!(error = %other, "could not query the container engine"),
            }
            let _ = report.record("engine", Outcome::Unsatisfied);
            return report;
        }
    };

    let platform = LinuxPlatform::new(&info, host.kind() == HostKind::Remote);
    if !report.step(&platform, host, fix).await {
        return report;
    }

    let _ = report.step(&OverlayStorage::new(&info), host, fix).await;

    let kernel = match info.kernel_version() {
        Some(v) => Some(v),
        None => host.kernel_version().await.ok(),
    };
    report.native_overlay = supports_native_overlay(kernel, info.engine_version());
    let _ = report
        .step(&FuseOverlay::new(report.native_overlay), host, fix)
        .await;
    let _ = report.step(&CgroupV2::new(&info, kernel), host, fix).await;
    let _ = report.step(&OciRuntime::new(&info), host, fix).await;

    let enforcing = host.selinux_enforcing().await;
    if enforcing {
        for boolean in ["container_manage_cgroup", "container_use_devices"] {
            let _ = report.step(&SelinuxBoolean::new(boolean), host, fix).await;
        }
    }

    let _ = report.step(&DnsPlugin, host, fix).await;
    let _ = report
        .step(&SysctlMinimum::new("fs.aio-max-nr", 1_048_576), host, fix)
        .await;
    let _ = report
        .step(&SysctlMinimum::new("kernel.pid_max", 4_194_304), host, fix)
        .await;

    let _ = report.step(&HasSudo, host, fix).await;
    if report.step(&LoopControlExists, host, fix).await {
        let _ = report.step(&LoopControlWritable, host, fix).await;
    }

    if enforcing && config.selinux_module {
        let _ = report
            .step(&SelinuxModule::new(source_dir), host, fix)
            .await;
    }

    report
}
