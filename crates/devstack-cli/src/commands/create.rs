//! `ceph-devstack create`: create the network, key pair and containers.

use std::process::ExitCode;

use clap::Args;
use devstack_common::types::Action;

use super::Session;

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Build images from local checkouts before creating.
    #[arg(short, long)]
    pub build: bool,

    /// Leave the lab running without scheduling a test run.
    #[arg(short, long)]
    pub wait: bool,
}

/// Host environment as seen by the containers, with `TEUTHOLOGY_WAIT` set
/// when `wait` is requested.
fn env_lookup(
    wait: bool,
    base: impl Fn(&str) -> Option<String>,
) -> impl Fn(&str) -> Option<String> {
    move |key| {
        if wait && key == "TEUTHOLOGY_WAIT" {
            Some("1".into())
        } else {
            base(key)
        }
    }
}

/// Executes the `create` command.
///
/// # Errors
///
/// Returns an error if requirements are unmet or any step fails.
pub async fn execute(session: &Session, args: &CreateArgs) -> anyhow::Result<ExitCode> {
    let lookup = env_lookup(args.wait, |key| std::env::var(key).ok());
    let topology = session.topology_with(lookup).await?;
    let ctx = session.context();
    if args.build {
        topology.apply(Action::Build, &ctx).await?;
    }
    topology.apply(Action::Create, &ctx).await?;
    Ok(ExitCode::SUCCESS)
}
