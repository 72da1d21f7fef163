//! `ceph-devstack wait`: block until a container exits.

use std::process::ExitCode;

use clap::Args;

use super::Session;

/// Arguments for the `wait` command.
#[derive(Args, Debug)]
pub struct WaitArgs {
    /// Container to wait for, e.g. `teuthology`.
    pub name: String,
}

/// Executes the `wait` command, exiting with the container's exit code.
///
/// # Errors
///
/// Returns an error if requirements are unmet, the container is unknown,
/// or the engine cannot wait on it.
pub async fn execute(session: &Session, args: &WaitArgs) -> anyhow::Result<ExitCode> {
    let topology = session.topology().await?;
    let code = topology.wait(&args.name).await?;
    tracing::info!(name = %args.name, code, "container exited");
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
