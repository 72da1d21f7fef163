//! Locating job logs in the test archive.
//!
//! The archive holds one directory per run, named
//! `<user>-<YYYY-MM-DD_HH:MM:SS>-<suite details>`, and inside it one
//! numeric directory per job containing `teuthology.log`.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use devstack_common::constants::JOB_LOG_FILE;
use devstack_common::error::{DevstackError, Result};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";
const TIMESTAMP_SHAPE: &[u8] = b"dddd-dd-dd_dd:dd:dd";
const MAX_USER_LEN: usize = 32;

fn valid_user(user: &str) -> bool {
    let mut chars = user.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    user.len() <= MAX_USER_LEN
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn has_timestamp_shape(candidate: &str) -> bool {
    candidate.len() == TIMESTAMP_SHAPE.len()
        && candidate
            .bytes()
            .zip(TIMESTAMP_SHAPE)
            .all(|(b, shape)| match shape {
                b'd' => b.is_ascii_digit(),
                sep => b == *sep,
            })
}

/// Timestamp embedded in a run directory name, or `None` when the name is
/// not a run directory.
pub fn log_timestamp(run_name: &str) -> Option<NaiveDateTime> {
    run_name
        .match_indices('-')
        .filter(|(i, _)| valid_user(&run_name[..*i]))
        .find_map(|(i, _)| {
            let candidate = run_name.get(i + 1..i + 1 + TIMESTAMP_SHAPE.len())?;
            if !has_timestamp_shape(candidate) {
                return None;
            }
            NaiveDateTime::parse_from_str(candidate, TIMESTAMP_FORMAT).ok()
        })
}

/// The run with the newest embedded timestamp.
///
/// # Errors
///
/// Returns `NotFound` when no name is a run directory.
pub fn most_recent_run<S: AsRef<str>>(runs: &[S]) -> Result<String> {
    runs.iter()
        .filter_map(|r| log_timestamp(r.as_ref()).map(|ts| (ts, r.as_ref())))
        .max_by_key(|(ts, _)| *ts)
        .map(|(_, name)| name.to_string())
        .ok_or_else(|| DevstackError::NotFound {
            kind: "run",
            id: "any".into(),
        })
}

/// The only job directory among `entries`.
///
/// # Errors
///
/// Returns `NotFound` when there is no entry and `TooManyJobs` when there
/// are several.
pub fn job_id<S: AsRef<str>>(entries: &[S]) -> Result<String> {
    match entries {
        [] => Err(DevstackError::NotFound {
            kind: "job",
            id: "any".into(),
        }),
        [only] => Ok(only.as_ref().to_string()),
        _ => {
            let mut jobs: Vec<String> = entries.iter().map(|e| e.as_ref().to_string()).collect();
            jobs.sort_by(|a, b| {
                let key = |j: &str| j.parse::<u64>().unwrap_or(u64::MAX);
                key(a).cmp(&key(b)).then_with(|| a.cmp(b))
            });
            Err(DevstackError::TooManyJobs { jobs })
        }
    }
}

/// Which log to fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRequest {
    /// Run directory; the most recent run when unset.
    pub run_name: Option<String>,
    /// Job directory; the run's only job when unset.
    pub job_id: Option<String>,
    /// Return the path instead of the content.
    pub locate: bool,
}

/// A fetched log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLog {
    /// File content, verbatim.
    Contents(String),
    /// File location.
    Path(PathBuf),
}

fn subdirectories(dir: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(dir).map_err(|e| DevstackError::io(dir, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DevstackError::io(dir, e))?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// Finds the log selected by `request` under `archive_dir`.
///
/// # Errors
///
/// Returns `NotFound` when the run, job or log file does not exist,
/// `TooManyJobs` when the job is ambiguous, or an I/O error.
pub fn find_log(archive_dir: &Path, request: &LogRequest) -> Result<JobLog> {
    let run = match &request.run_name {
        Some(run) => run.clone(),
        None => most_recent_run(&subdirectories(archive_dir)?)?,
    };
    let run_dir = archive_dir.join(&run);
    if !run_dir.is_dir() {
        return Err(DevstackError::NotFound { kind: "run", id: run });
    }
    let job = match &request.job_id {
        Some(job) => job.clone(),
        None => job_id(&subdirectories(&run_dir)?)?,
    };
    let path = run_dir.join(&job).join(JOB_LOG_FILE);
    if !path.is_file() {
        return Err(DevstackError::NotFound {
            kind: "log",
            id: path.display().to_string(),
        });
    }
    tracing::debug!(path = %path.display(), "found job log");
    if request.locate {
        return Ok(JobLog::Path(path));
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| DevstackError::io(&path, e))?;
    Ok(JobLog::Contents(contents))
}
