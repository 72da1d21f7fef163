//! `ceph-devstack pull|build|start|stop|remove`: apply one action to the
//! whole topology.

use std::process::ExitCode;

use devstack_common::types::Action;

use super::Session;

/// Executes a plain topology action.
///
/// # Errors
///
/// Returns an error if requirements are unmet or the action fails.
pub async fn execute(session: &Session, action: Action) -> anyhow::Result<ExitCode> {
    let topology = session.topology().await?;
    topology.apply(action, &session.context()).await?;
    Ok(ExitCode::SUCCESS)
}
