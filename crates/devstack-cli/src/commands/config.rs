//! `ceph-devstack config`: print the effective configuration.

use std::process::ExitCode;

use devstack_common::config::{DevstackConfig, Overrides};

use super::GlobalArgs;

/// Loads the configuration the other commands would use, with command-line
/// overrides applied.
///
/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
pub fn effective_config(global: &GlobalArgs) -> anyhow::Result<DevstackConfig> {
    let overrides = Overrides {
        data_dir: global.data_dir.clone(),
        dry_run: global.dry_run,
        testnode_count: global.testnode_count,
    };
    Ok(DevstackConfig::load(global.config.as_deref())?.with_overrides(&overrides))
}

/// Executes the `config` command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or serialized.
#[allow(clippy::print_stdout)]
pub fn execute(global: &GlobalArgs) -> anyhow::Result<ExitCode> {
    let config = effective_config(global)?;
    print!("{}", config.to_yaml()?);
    Ok(ExitCode::SUCCESS)
}
