//! CLI command definitions and dispatch.

pub mod config;
pub mod create;
pub mod doctor;
pub mod lifecycle;
pub mod logs;
pub mod wait;
pub mod watch;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use devstack_common::config::DevstackConfig;
use devstack_common::error::DevstackError;
use devstack_common::types::Action;
use devstack_core::exec::{CommandRunner, ProcessRunner, RecordingRunner};
use devstack_core::host::{self, Host};
use devstack_core::requirements::{Report, check_requirements};
use devstack_runtime::resource::RunContext;
use devstack_runtime::topology::Topology;
use tokio_util::sync::CancellationToken;

/// Run a containerized teuthology lab on one machine.
#[derive(Parser, Debug)]
#[command(name = "ceph-devstack", version, about, long_about = None)]
pub struct Cli {
    /// Options shared by every subcommand.
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Options shared by every subcommand.
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Configuration file merged over the built-in defaults.
    #[arg(short, long, global = true, env = "CEPH_DEVSTACK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print commands instead of running them.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Be more verbose.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Store temporary data, e.g. disk images, here.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Number of test nodes to run.
    #[arg(long, global = true)]
    pub testnode_count: Option<u32>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check host requirements, optionally fixing what can be fixed.
    Doctor(doctor::DoctorArgs),
    /// Pull container images.
    Pull,
    /// Build images for services with a local checkout.
    Build,
    /// Create the network, key pair and containers.
    Create(create::CreateArgs),
    /// Create anything missing, then start every container.
    Start,
    /// Stop every container.
    Stop,
    /// Destroy the containers, key pair and network.
    Remove,
    /// Monitor the containers, recreating any that stop.
    Watch,
    /// Wait for a container to exit and exit with its code.
    Wait(wait::WaitArgs),
    /// Print a job log from the test archive.
    Logs(logs::LogsArgs),
    /// Print the effective configuration.
    Config,
}

/// Per-invocation state: the effective configuration, the hosts commands
/// run on, and the interrupt token.
pub struct Session {
    /// Effective configuration.
    pub config: Arc<DevstackConfig>,
    /// Host lifecycle commands run on; records instead of running in
    /// dry-run mode.
    pub host: Arc<dyn Host>,
    /// Host requirement probes run on. Probes only read state, so this is
    /// a real host even in dry-run mode.
    pub probe_host: Arc<dyn Host>,
    /// Fired on Ctrl+C.
    pub cancel: CancellationToken,
}

impl Session {
    /// Loads configuration and connects to the engine host.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded.
    pub fn new(global: &GlobalArgs, cancel: CancellationToken) -> anyhow::Result<Self> {
        let config = config::effective_config(global)?;
        let real: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
        let runner: Arc<dyn CommandRunner> = if config.dry_run {
            Arc::new(RecordingRunner::dry_run(&config.engine))
        } else {
            Arc::clone(&real)
        };
        let probe_host = host::connect(config.host, real, &config.engine, &config.tunnel_prefix);
        let host = host::connect(config.host, runner, &config.engine, &config.tunnel_prefix);
        Ok(Self {
            config: Arc::new(config),
            host,
            probe_host,
            cancel,
        })
    }

    /// A fresh run context.
    pub fn context(&self) -> RunContext {
        RunContext::new(&self.config, self.cancel.clone())
    }

    /// Runs the requirement chain. Fixes are never applied in dry-run mode.
    pub async fn requirements(&self, fix: bool) -> Report {
        let fix = if fix && self.config.dry_run {
            tracing::warn!("not applying fixes in dry-run mode");
            false
        } else {
            fix
        };
        check_requirements(
            self.probe_host.as_ref(),
            &self.config.requirements,
            &self.config.source_dir,
            fix,
        )
        .await
    }

    /// Checks requirements, then resolves the topology.
    ///
    /// # Errors
    ///
    /// Returns `RequirementsNotMet` when the host is not ready.
    pub async fn topology(&self) -> anyhow::Result<Topology> {
        self.topology_with(|key| std::env::var(key).ok()).await
    }

    /// [`Session::topology`] with container environment overrides read
    /// from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `RequirementsNotMet` when the host is not ready.
    pub async fn topology_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Topology> {
        let report = self.requirements(false).await;
        if !report.passed() {
            return Err(DevstackError::RequirementsNotMet.into());
        }
        Ok(Topology::resolve_with(
            &self.config,
            Arc::clone(&self.host),
            report.native_overlay,
            lookup,
        )
        .await)
    }
}

fn install_interrupt_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        tracing::warn!("interrupted; finishing up (press Ctrl+C again to exit now)");
        cancel.cancel();
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))
}

async fn dispatch(cli: Cli, cancel: CancellationToken) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Command::Config => return config::execute(&cli.global),
        Command::Logs(args) => return logs::execute(&cli.global, args),
        _ => {}
    }
    let session = Session::new(&cli.global, cancel)?;
    match cli.command {
        Command::Doctor(args) => doctor::execute(&session, &args).await,
        Command::Pull => lifecycle::execute(&session, Action::Pull).await,
        Command::Build => lifecycle::execute(&session, Action::Build).await,
        Command::Create(args) => create::execute(&session, &args).await,
        Command::Start => lifecycle::execute(&session, Action::Start).await,
        Command::Stop => lifecycle::execute(&session, Action::Stop).await,
        Command::Remove => lifecycle::execute(&session, Action::Remove).await,
        Command::Watch => watch::execute(&session).await,
        Command::Wait(args) => wait::execute(&session, &args).await,
        Command::Config | Command::Logs(_) => Ok(ExitCode::SUCCESS),
    }
}

/// Dispatches the parsed CLI command to its handler on a single-threaded
/// runtime.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone())?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dispatch(cli, cancel))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "ceph-devstack",
            "start",
            "--dry-run",
            "-v",
            "--data-dir",
            "/srv/devstack",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Start));
        assert!(cli.global.dry_run);
        assert!(cli.global.verbose);
        assert_eq!(cli.global.data_dir, Some(PathBuf::from("/srv/devstack")));
    }

    #[test]
    fn wait_requires_a_name() {
        assert!(Cli::try_parse_from(["ceph-devstack", "wait"]).is_err());
        let cli = Cli::try_parse_from(["ceph-devstack", "wait", "teuthology"]).unwrap();
        assert!(matches!(cli.command, Command::Wait(args) if args.name == "teuthology"));
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["ceph-devstack", "explode"]).is_err());
    }
}
