//! `ceph-devstack doctor`: check that the host can run the lab.

use std::process::ExitCode;

use clap::Args;

use super::Session;
use crate::output;

/// Arguments for the `doctor` command.
#[derive(Args, Debug)]
pub struct DoctorArgs {
    /// Apply the suggested fixes where possible.
    #[arg(long)]
    pub fix: bool,
}

/// Executes the `doctor` command.
///
/// Exits with failure when any requirement remains unmet.
pub async fn execute(session: &Session, args: &DoctorArgs) -> anyhow::Result<ExitCode> {
    let report = session.requirements(args.fix).await;
    output::print_report(&report);
    if report.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
