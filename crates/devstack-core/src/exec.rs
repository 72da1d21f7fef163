//! External process execution.
//!
//! Every interaction with the container engine and the host's tooling goes
//! through a [`CommandRunner`]. The production runner spawns processes with
//! `tokio::process`; [`RecordingRunner`] answers from scripted rules and backs
//! both `--dry-run` and the test suites.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use devstack_common::error::{DevstackError, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;

/// An argv plus the context it runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stream_label: Option<String>,
}

impl Command {
    /// Creates a command from argv tokens.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Runs the command in `dir`.
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Adds an environment variable on top of the inherited environment.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.env.insert(key.into(), value.into());
        self
    }

    /// Logs each output line as it arrives, prefixed with `label`.
    #[must_use]
    pub fn stream_output(mut self, label: impl Into<String>) -> Self {
        self.stream_label = Some(label.into());
        self
    }

    /// Prepends `prefix` to the argv.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &[String]) -> Self {
        let mut args = prefix.to_vec();
        args.append(&mut self.args);
        self.args = args;
        self
    }

    /// The full argv.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The first argv token, or an empty string for an empty command.
    pub fn program(&self) -> &str {
        self.args.first().map_or("", String::as_str)
    }

    /// Working directory, if one was set.
    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Extra environment variables.
    pub const fn envs(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Streaming label, if output is streamed to the log.
    pub fn stream_label(&self) -> Option<&str> {
        self.stream_label.as_deref()
    }

    fn log_line(&self) -> String {
        match &self.cwd {
            Some(cwd) => format!("> {self} cwd='{}'", cwd.display()),
            None => format!("> {self}"),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

/// Result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// The argv that ran.
    pub args: Vec<String>,
    /// Exit code; `-1` when the process was killed by a signal.
    pub code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the process exited with status zero.
    pub const fn success(&self) -> bool {
        self.code == 0
    }

    /// Converts a nonzero exit into [`DevstackError::ProcessFailed`].
    ///
    /// # Errors
    ///
    /// Returns `ProcessFailed` carrying the argv, exit code and stderr.
    pub fn check(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(DevstackError::ProcessFailed {
                command: self.args.join(" "),
                code: self.code,
                stderr: self.stderr,
            })
        }
    }
}

enum ProcessState {
    Spawned {
        child: Child,
        label: Option<String>,
    },
    Finished(CommandOutput),
}

/// Handle to a process that may still be running.
pub struct RunningProcess {
    args: Vec<String>,
    state: ProcessState,
}

impl fmt::Debug for RunningProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningProcess")
            .field("args", &self.args)
            .field("pid", &self.id())
            .finish()
    }
}

impl RunningProcess {
    /// Wraps an already-completed result.
    pub fn finished(output: CommandOutput) -> Self {
        Self {
            args: output.args.clone(),
            state: ProcessState::Finished(output),
        }
    }

    /// OS process id while the process is alive.
    pub fn id(&self) -> Option<u32> {
        match &self.state {
            ProcessState::Spawned { child, .. } => child.id(),
            ProcessState::Finished(_) => None,
        }
    }

    /// Waits for exit while draining stdout and stderr concurrently.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the child fails.
    pub async fn wait(self) -> Result<CommandOutput> {
        let (mut child, label) = match self.state {
            ProcessState::Finished(output) => return Ok(output),
            ProcessState::Spawned { child, label } => (child, label),
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, stdout, stderr) = tokio::join!(
            child.wait(),
            drain(stdout, label.as_deref(), false),
            drain(stderr, label.as_deref(), true),
        );
        let program = self.args.first().cloned().unwrap_or_default();
        let status = status.map_err(|e| DevstackError::io(program, e))?;
        Ok(CommandOutput {
            args: self.args,
            code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

async fn drain<R>(reader: Option<R>, label: Option<&str>, is_stderr: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let mut captured = String::new();
    let Some(reader) = reader else {
        return captured;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = String::from_utf8_lossy(&buf);
                if let Some(label) = label {
                    let trimmed = chunk.trim_end();
                    if !trimmed.is_empty() {
                        if is_stderr {
                            tracing::warn!("{label}: {trimmed}");
                        } else {
                            tracing::info!("{label}: {trimmed}");
                        }
                    }
                }
                captured.push_str(&chunk);
            }
            Err(e) => {
                tracing::debug!(error = %e, "stopped reading process output");
                break;
            }
        }
    }
    captured
}

/// Executes commands.
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Starts a command without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns `CommandNotFound` if the program does not exist, or an I/O
    /// error if spawning fails.
    fn spawn(&self, command: &Command) -> Result<RunningProcess>;

    /// Runs a command to completion, suspending only the calling task.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned or awaited. A
    /// nonzero exit is not an error here; see [`CommandOutput::check`].
    async fn run(&self, command: &Command) -> Result<CommandOutput> {
        self.spawn(command)?.wait().await
    }

    /// Runs a command to completion, blocking the thread.
    ///
    /// # Errors
    ///
    /// Same as [`CommandRunner::run`].
    fn run_blocking(&self, command: &Command) -> Result<CommandOutput>;
}

/// Runner that executes real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    fn resolve(command: &Command) -> Result<PathBuf> {
        let program = command.program();
        if program.is_empty() {
            return Err(DevstackError::Config {
                message: "cannot run an empty command".into(),
            });
        }
        which::which(program).map_err(|_| DevstackError::CommandNotFound {
            program: program.to_string(),
        })
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    fn spawn(&self, command: &Command) -> Result<RunningProcess> {
        tracing::debug!("{}", command.log_line());
        let path = Self::resolve(command)?;
        let mut cmd = tokio::process::Command::new(&path);
        let _ = cmd
            .args(&command.args()[1..])
            .envs(command.envs())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = command.working_dir() {
            let _ = cmd.current_dir(dir);
        }
        let child = cmd.spawn().map_err(|e| DevstackError::io(&path, e))?;
        Ok(RunningProcess {
            args: command.args().to_vec(),
            state: ProcessState::Spawned {
                child,
                label: command.stream_label().map(ToString::to_string),
            },
        })
    }

    fn run_blocking(&self, command: &Command) -> Result<CommandOutput> {
        tracing::debug!("{}", command.log_line());
        let path = Self::resolve(command)?;
        let mut cmd = std::process::Command::new(&path);
        let _ = cmd
            .args(&command.args()[1..])
            .envs(command.envs())
            .stdin(Stdio::null());
        if let Some(dir) = command.working_dir() {
            let _ = cmd.current_dir(dir);
        }
        let output = cmd.output().map_err(|e| DevstackError::io(&path, e))?;
        Ok(CommandOutput {
            args: command.args().to_vec(),
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

type Matcher = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

struct Rule {
    matches: Matcher,
    code: i32,
    stdout: String,
}

/// Runner that records every command and answers from scripted rules.
///
/// Rules are consulted newest first; a command matching none gets the
/// default exit code and empty output.
#[derive(Default)]
pub struct RecordingRunner {
    default_code: i32,
    echo: bool,
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Command>>,
}

impl fmt::Debug for RecordingRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingRunner")
            .field("default_code", &self.default_code)
            .field("echo", &self.echo)
            .field("calls", &self.calls.lock().map(|c| c.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl RecordingRunner {
    /// Creates a runner where every command succeeds silently.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner for `--dry-run`: prints each command and reports every
    /// engine resource as absent so that creates are shown.
    pub fn dry_run(engine: &str) -> Self {
        let runner = Self {
            echo: true,
            ..Self::default()
        };
        let engine = engine.to_string();
        runner.respond_when(
            move |args| {
                args.first().is_some_and(|p| *p == engine)
                    && args.iter().any(|a| a == "inspect")
            },
            1,
            "",
        );
        runner
    }

    /// Sets the exit code returned when no rule matches.
    #[must_use]
    pub const fn with_default_code(mut self, code: i32) -> Self {
        self.default_code = code;
        self
    }

    /// Answers commands starting with `prefix`.
    pub fn respond<I, S>(&self, prefix: I, code: i32, stdout: impl Into<String>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix: Vec<String> = prefix.into_iter().map(Into::into).collect();
        self.respond_when(move |args| args.starts_with(&prefix), code, stdout);
    }

    /// Answers commands accepted by `matches`.
    pub fn respond_when(
        &self,
        matches: impl Fn(&[String]) -> bool + Send + Sync + 'static,
        code: i32,
        stdout: impl Into<String>,
    ) {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Rule {
                matches: Box::new(matches),
                code,
                stdout: stdout.into(),
            });
    }

    /// Every command seen so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every argv seen so far, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.commands()
            .into_iter()
            .map(|c| c.args().to_vec())
            .collect()
    }

    /// Index of the first recorded argv starting with `prefix`.
    pub fn position(&self, prefix: &[&str]) -> Option<usize> {
        self.calls().iter().position(|c| starts_with(c, prefix))
    }

    /// Number of recorded argvs starting with `prefix`.
    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls().iter().filter(|c| starts_with(c, prefix)).count()
    }

    fn answer(&self, command: &Command) -> CommandOutput {
        if self.echo {
            tracing::info!("{command}");
        } else {
            tracing::debug!("{}", command.log_line());
        }
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());
        let rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let (code, stdout) = rules
            .iter()
            .rev()
            .find(|r| (r.matches)(command.args()))
            .map_or((self.default_code, String::new()), |r| {
                (r.code, r.stdout.clone())
            });
        CommandOutput {
            args: command.args().to_vec(),
            code,
            stdout,
            stderr: String::new(),
        }
    }
}

fn starts_with(args: &[String], prefix: &[&str]) -> bool {
    args.len() >= prefix.len() && args.iter().zip(prefix).all(|(a, p)| a == p)
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    fn spawn(&self, command: &Command) -> Result<RunningProcess> {
        Ok(RunningProcess::finished(self.answer(command)))
    }

    fn run_blocking(&self, command: &Command) -> Result<CommandOutput> {
        Ok(self.answer(command))
    }
}
