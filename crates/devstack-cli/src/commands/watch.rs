//! `ceph-devstack watch`: keep every container running until interrupted.

use std::process::ExitCode;

use super::Session;

/// Executes the `watch` command. Returns normally on Ctrl+C.
///
/// # Errors
///
/// Returns an error if requirements are unmet.
pub async fn execute(session: &Session) -> anyhow::Result<ExitCode> {
    let topology = session.topology().await?;
    topology
        .watch(&session.context(), session.config.watch_interval())
        .await;
    Ok(ExitCode::SUCCESS)
}
