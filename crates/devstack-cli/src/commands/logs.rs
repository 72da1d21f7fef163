//! `ceph-devstack logs`: print a job's `teuthology.log` from the archive.

use std::io::{BufRead, Write};
use std::process::ExitCode;

use clap::Args;
use devstack_common::error::DevstackError;
use devstack_runtime::logs::{JobLog, LogRequest, find_log};

use super::GlobalArgs;
use super::config::effective_config;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Run directory to read; defaults to the most recent run.
    #[arg(long)]
    pub run_name: Option<String>,

    /// Job to read; required when the run has more than one.
    #[arg(long)]
    pub job_id: Option<String>,

    /// Print the log's path instead of its content.
    #[arg(long)]
    pub locate: bool,
}

impl From<&LogsArgs> for LogRequest {
    fn from(args: &LogsArgs) -> Self {
        Self {
            run_name: args.run_name.clone(),
            job_id: args.job_id.clone(),
            locate: args.locate,
        }
    }
}

/// Asks the user to pick one of `jobs`.
#[allow(clippy::print_stderr)]
fn choose_job(jobs: &[String], input: &mut impl BufRead) -> anyhow::Result<String> {
    eprintln!("Found multiple jobs: {}", jobs.join(", "));
    eprint!("Which job? ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    let _ = input.read_line(&mut line)?;
    let choice = line.trim();
    if jobs.iter().any(|j| j == choice) {
        Ok(choice.to_owned())
    } else {
        Err(DevstackError::InvalidSelection {
            choice: choice.to_owned(),
        }
        .into())
    }
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, nothing matches,
/// or an interactive job choice is invalid.
#[allow(clippy::print_stdout)]
pub fn execute(global: &GlobalArgs, args: &LogsArgs) -> anyhow::Result<ExitCode> {
    let archive_dir = effective_config(global)?.archive_dir();
    let mut request = LogRequest::from(args);
    let log = match find_log(&archive_dir, &request) {
        Err(DevstackError::TooManyJobs { jobs }) => {
            request.job_id = Some(choose_job(&jobs, &mut std::io::stdin().lock())?);
            find_log(&archive_dir, &request)?
        }
        other => other?,
    };
    match log {
        JobLog::Contents(contents) => print!("{contents}"),
        JobLog::Path(path) => println!("{}", path.display()),
    }
    Ok(ExitCode::SUCCESS)
}
