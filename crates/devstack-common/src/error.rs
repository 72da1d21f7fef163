//! Unified error types for the ceph-devstack workspace.
//!
//! Unmet host requirements are deliberately absent from this enum: they are
//! reported and aggregated by the requirement evaluator, never raised.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum DevstackError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// An external program could not be located on the host.
    #[error("command not found: {program}")]
    CommandNotFound {
        /// Name of the missing program.
        program: String,
    },

    /// The container engine binary itself is missing.
    #[error("{engine} not found. Try: dnf install {engine}")]
    EngineNotFound {
        /// Name of the engine binary.
        engine: String,
    },

    /// An external command exited with a nonzero status.
    #[error("command `{command}` failed with exit code {code}{}", stderr_suffix(.stderr))]
    ProcessFailed {
        /// The failing argv, joined with spaces.
        command: String,
        /// Exit code reported by the process (`-1` when killed by a signal).
        code: i32,
        /// Captured standard error, possibly empty.
        stderr: String,
    },

    /// A lifecycle action name is not part of the supported set.
    #[error("unknown action: {name}")]
    UnknownAction {
        /// The rejected action name.
        name: String,
    },

    /// A container never reported healthy within the allotted time.
    #[error("{name} did not become healthy within {timeout:?}")]
    HealthCheckTimeout {
        /// Container name.
        name: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// The operation was interrupted by the operator.
    #[error("interrupted")]
    Cancelled,

    /// More than one job directory matched a log query.
    #[error("too many jobs found: {}", .jobs.join(", "))]
    TooManyJobs {
        /// Every candidate job identifier.
        jobs: Vec<String>,
    },

    /// An interactive choice did not name one of the offered entries.
    #[error("invalid selection: {choice}")]
    InvalidSelection {
        /// The rejected input.
        choice: String,
    },

    /// Host requirements were evaluated and at least one is unmet.
    #[error("requirements not met")]
    RequirementsNotMet,

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// YAML serialization or deserialization failed.
    #[error("YAML error: {source}")]
    Yaml {
        /// Underlying YAML error.
        #[from]
        source: serde_yaml::Error,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

impl DevstackError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns whether this error came from a nonzero exit status.
    pub const fn is_process_failure(&self) -> bool {
        matches!(self, Self::ProcessFailed { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DevstackError>;
