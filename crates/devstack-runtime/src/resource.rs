//! The generic resource state machine.
//!
//! A [`Resource`] is a transient command builder for one engine object. It
//! holds a name, a fixed set of attribute values usable as `{placeholder}`s
//! in its command templates, and a [`CommandSet`] that supplies those
//! templates. The engine is the store of truth; nothing here is persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use devstack_common::config::DevstackConfig;
use devstack_common::error::{DevstackError, Result};
use devstack_common::types::Action;
use devstack_core::exec::{Command, CommandOutput};
use devstack_core::host::Host;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Attributes a command template may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Attr {
    /// `{name}`
    Name,
    /// `{image}`
    Image,
    /// `{repo}`
    Repo,
    /// `{archive_dir}`
    ArchiveDir,
    /// `{data_dir}`
    DataDir,
    /// `{source_dir}`
    SourceDir,
    /// `{privkey_path}`
    PrivkeyPath,
    /// `{pubkey_path}`
    PubkeyPath,
}

impl Attr {
    /// Placeholder text including braces.
    pub const fn placeholder(self) -> &'static str {
        match self {
            Self::Name => "{name}",
            Self::Image => "{image}",
            Self::Repo => "{repo}",
            Self::ArchiveDir => "{archive_dir}",
            Self::DataDir => "{data_dir}",
            Self::SourceDir => "{source_dir}",
            Self::PrivkeyPath => "{privkey_path}",
            Self::PubkeyPath => "{pubkey_path}",
        }
    }
}

/// Supplies the command template for each lifecycle action of a kind.
pub trait CommandSet: Send + Sync + fmt::Debug {
    /// Template for `action`, or `None` when the kind does not support it.
    fn template(&self, action: Action) -> Option<&[String]>;

    /// Template probing whether the object exists.
    fn inspect(&self) -> Option<&[String]>;

    /// Whether `start` must wait for the engine to report healthy.
    fn has_health_check(&self) -> bool {
        self.template(Action::Create).is_some_and(|t| {
            t.iter()
                .any(|a| a == "--health-cmd" || a == "--healthcheck-cmd")
        })
    }
}

/// Table-driven [`CommandSet`].
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: BTreeMap<Action, Vec<String>>,
    inspect: Option<Vec<String>>,
}

fn tokens<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}

impl TemplateSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the template for `action`.
    #[must_use]
    pub fn with<I, S>(mut self, action: Action, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _ = self.templates.insert(action, tokens(args));
        self
    }

    /// Sets the existence probe.
    #[must_use]
    pub fn with_inspect<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inspect = Some(tokens(args));
        self
    }
}

impl CommandSet for TemplateSet {
    fn template(&self, action: Action) -> Option<&[String]> {
        self.templates.get(&action).map(Vec::as_slice)
    }

    fn inspect(&self) -> Option<&[String]> {
        self.inspect.as_deref()
    }
}

/// Actions already applied per resource name during one run.
#[derive(Debug, Default)]
pub struct ApplyLog(Mutex<HashMap<String, BTreeSet<Action>>>);

impl ApplyLog {
    /// Whether `action` was recorded for `name`.
    pub fn contains(&self, name: &str, action: Action) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .is_some_and(|set| set.contains(&action))
    }

    /// Records `action` for `name`.
    pub fn record(&self, name: &str, action: Action) {
        let _ = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .insert(action);
    }

    /// Drops everything recorded for `name`.
    pub fn forget(&self, name: &str) {
        let _ = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

/// Per-run state shared by every lifecycle call.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Cancelled on operator interrupt.
    pub cancel: CancellationToken,
    /// Upper bound on health polling per container.
    pub health_timeout: Duration,
    /// Delay between health probes.
    pub health_interval: Duration,
    /// Reconciliation state for this run.
    pub applied: Arc<ApplyLog>,
}

impl RunContext {
    /// Builds a context with timings from `config`.
    pub fn new(config: &DevstackConfig, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            health_timeout: config.health_timeout(),
            health_interval: config.health_interval(),
            applied: Arc::default(),
        }
    }
}

/// One engine object.
#[derive(Clone)]
pub struct Resource {
    kind: &'static str,
    name: String,
    attrs: BTreeMap<Attr, String>,
    commands: Arc<dyn CommandSet>,
    host: Arc<dyn Host>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(name=\"{}\")", self.kind, self.name)
    }
}

impl Resource {
    /// Creates a resource named after its lowercased kind tag.
    pub fn new(kind: &'static str, commands: impl CommandSet + 'static, host: Arc<dyn Host>) -> Self {
        Self::with_name(kind, kind.to_lowercase(), commands, host)
    }

    /// Creates a resource with an explicit name. The name cannot change
    /// afterwards.
    pub fn with_name(
        kind: &'static str,
        name: impl Into<String>,
        commands: impl CommandSet + 'static,
        host: Arc<dyn Host>,
    ) -> Self {
        let name = name.into();
        let mut attrs = BTreeMap::new();
        let _ = attrs.insert(Attr::Name, name.clone());
        Self {
            kind,
            name,
            attrs,
            commands: Arc::new(commands),
            host,
        }
    }

    /// Sets a template attribute. [`Attr::Name`] is fixed at construction
    /// and ignored here.
    #[must_use]
    pub fn attr(mut self, attr: Attr, value: impl Into<String>) -> Self {
        if attr != Attr::Name {
            let _ = self.attrs.insert(attr, value.into());
        }
        self
    }

    /// Engine name of the object.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind tag, e.g. `network`.
    pub const fn kind(&self) -> &'static str {
        self.kind
    }

    /// Value of an attribute, if set.
    pub fn value(&self, attr: Attr) -> Option<&str> {
        self.attrs.get(&attr).map(String::as_str)
    }

    /// Host the resource's commands run on.
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// The resource's command templates.
    pub fn commands(&self) -> &dyn CommandSet {
        self.commands.as_ref()
    }

    /// Substitutes attribute placeholders. Tokens referring to attributes
    /// the resource does not carry are returned as constructed.
    pub fn format_cmd<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        args.iter()
            .map(|token| {
                let mut token = token.as_ref().to_string();
                for (attr, value) in &self.attrs {
                    if token.contains(attr.placeholder()) {
                        token = token.replace(attr.placeholder(), value);
                    }
                }
                token
            })
            .collect()
    }

    /// Formatted argv for `action`, if the kind supports it.
    pub fn argv(&self, action: Action) -> Option<Vec<String>> {
        self.commands.template(action).map(|t| self.format_cmd(t))
    }

    /// Runs a command on the resource's host and fails on nonzero exit.
    ///
    /// # Errors
    ///
    /// Returns `ProcessFailed` on nonzero exit, or a spawn error.
    pub async fn run_checked(&self, command: Command) -> Result<CommandOutput> {
        self.host.run(command).await?.check()
    }

    /// Runs the template for `action` without any existence check. Kinds
    /// without a template for it succeed without running anything.
    ///
    /// # Errors
    ///
    /// Returns `ProcessFailed` on nonzero exit.
    pub async fn run_action(&self, action: Action) -> Result<()> {
        let Some(argv) = self.argv(action) else {
            return Ok(());
        };
        let _ = self.run_checked(Command::new(argv)).await?;
        Ok(())
    }

    /// Whether the engine knows this object. Kinds without an inspect
    /// template always report `false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe cannot be spawned.
    pub async fn exists(&self) -> Result<bool> {
        let Some(template) = self.commands.inspect() else {
            return Ok(false);
        };
        let output = self.host.run(Command::new(self.format_cmd(template))).await?;
        Ok(output.success())
    }

    /// Parsed output of the inspect probe.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the kind has no inspect template,
    /// `ProcessFailed` when the object is absent, or a JSON error.
    pub async fn inspect(&self) -> Result<serde_json::Value> {
        let template = self.commands.inspect().ok_or_else(|| DevstackError::NotFound {
            kind: "inspect template",
            id: self.name.clone(),
        })?;
        let output = self
            .run_checked(Command::new(self.format_cmd(template)))
            .await?;
        Ok(serde_json::from_str(&output.stdout)?)
    }

    /// Creates the object unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns `ProcessFailed` if the create command fails.
    pub async fn create(&self) -> Result<()> {
        if self.exists().await? {
            tracing::debug!(name = %self.name, "already exists");
            return Ok(());
        }
        let Some(argv) = self.argv(Action::Create) else {
            return Ok(());
        };
        tracing::debug!(name = %self.name, "creating");
        let _ = self.run_checked(Command::new(argv)).await?;
        tracing::debug!(name = %self.name, "created");
        Ok(())
    }

    /// Starts the object and waits for it to report healthy when the kind
    /// declares a health check.
    ///
    /// # Errors
    ///
    /// Returns `ProcessFailed` if the start command fails,
    /// `HealthCheckTimeout` if it never becomes healthy, or `Cancelled`.
    pub async fn start(&self, ctx: &RunContext) -> Result<()> {
        let Some(argv) = self.argv(Action::Start) else {
            return Ok(());
        };
        tracing::debug!(name = %self.name, "starting");
        let _ = self.run_checked(Command::new(argv)).await?;
        if self.commands.has_health_check() {
            self.wait_healthy(ctx).await?;
        }
        tracing::debug!(name = %self.name, "started");
        Ok(())
    }

    async fn wait_healthy(&self, ctx: &RunContext) -> Result<()> {
        let deadline = Instant::now() + ctx.health_timeout;
        let probe = Command::new([self.host.engine(), "healthcheck", "run", self.name.as_str()]);
        loop {
            if self.host.run(probe.clone()).await?.success() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DevstackError::HealthCheckTimeout {
                    name: self.name.clone(),
                    timeout: ctx.health_timeout,
                });
            }
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(DevstackError::Cancelled),
                () = tokio::time::sleep(ctx.health_interval) => {}
            }
        }
    }

    /// Stops the object.
    ///
    /// # Errors
    ///
    /// Returns `ProcessFailed` if the stop command fails.
    pub async fn stop(&self) -> Result<()> {
        let Some(argv) = self.argv(Action::Stop) else {
            return Ok(());
        };
        tracing::debug!(name = %self.name, "stopping");
        let _ = self.run_checked(Command::new(argv)).await?;
        tracing::debug!(name = %self.name, "stopped");
        Ok(())
    }

    /// Removes the object. Failures are logged, not returned.
    pub async fn remove(&self) {
        let Some(argv) = self.argv(Action::Remove) else {
            return;
        };
        tracing::debug!(name = %self.name, "removing");
        match self.run_checked(Command::new(argv)).await {
            Ok(_) => tracing::debug!(name = %self.name, "removed"),
            Err(e) => tracing::warn!(name = %self.name, error = %e, "remove failed"),
        }
    }

    /// Whether the object exists and the engine reports it running.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe cannot be spawned or prints invalid
    /// JSON.
    pub async fn is_running(&self) -> Result<bool> {
        let Some(template) = self.commands.inspect() else {
            return Ok(false);
        };
        let output = self.host.run(Command::new(self.format_cmd(template))).await?;
        if !output.success() {
            return Ok(false);
        }
        let value: serde_json::Value = serde_json::from_str(&output.stdout)?;
        Ok(state_status(&value).is_some_and(|s| s.eq_ignore_ascii_case("running")))
    }
}

/// `State.Status` of the first inspected object.
fn state_status(value: &serde_json::Value) -> Option<&str> {
    let object = value
        .as_array()
        .map_or(Some(value), |items| items.first())?;
    object.pointer("/State/Status")?.as_str()
}

/// The dispatch table every managed kind implements.
#[async_trait]
pub trait Lifecycle: Send + Sync + fmt::Debug {
    /// Engine name of the object.
    fn name(&self) -> &str;

    /// Fetches the object's image.
    async fn pull(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    /// Builds the object's image from source.
    async fn build(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    /// Creates the object unless it exists.
    async fn create(&self, ctx: &RunContext) -> Result<()>;

    /// Starts the object.
    async fn start(&self, ctx: &RunContext) -> Result<()>;

    /// Stops the object.
    async fn stop(&self, ctx: &RunContext) -> Result<()>;

    /// Removes the object, best effort.
    async fn remove(&self, ctx: &RunContext) -> Result<()>;

    /// Whether the engine knows the object.
    async fn exists(&self) -> Result<bool>;

    /// Whether the object is running.
    async fn is_running(&self) -> Result<bool>;
}

#[async_trait]
impl Lifecycle for Resource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, _ctx: &RunContext) -> Result<()> {
        Self::create(self).await
    }

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        Self::start(self, ctx).await
    }

    async fn stop(&self, _ctx: &RunContext) -> Result<()> {
        Self::stop(self).await
    }

    async fn remove(&self, _ctx: &RunContext) -> Result<()> {
        Self::remove(self).await;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Self::exists(self).await
    }

    async fn is_running(&self) -> Result<bool> {
        Self::is_running(self).await
    }
}

/// Applies `action` to `target`, consulting and updating the run's
/// apply-log. Pull, build and create already applied in this run are
/// skipped; remove clears the record.
///
/// # Errors
///
/// Propagates the action's error.
pub async fn apply(target: &dyn Lifecycle, action: Action, ctx: &RunContext) -> Result<()> {
    let name = target.name().to_string();
    if action.is_idempotent() && ctx.applied.contains(&name, action) {
        tracing::debug!(name = %name, %action, "already applied in this run");
        return Ok(());
    }
    match action {
        Action::Pull => target.pull(ctx).await?,
        Action::Build => target.build(ctx).await?,
        Action::Create => target.create(ctx).await?,
        Action::Start => target.start(ctx).await?,
        Action::Stop => target.stop(ctx).await?,
        Action::Remove => target.remove(ctx).await?,
    }
    if action == Action::Remove {
        ctx.applied.forget(&name);
    } else {
        ctx.applied.record(&name, action);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use devstack_core::exec::RecordingRunner;
    use devstack_core::host::LocalHost;

    use super::*;

    fn secret_templates() -> TemplateSet {
        TemplateSet::new()
            .with_inspect(["podman", "secret", "inspect", "{name}"])
            .with(Action::Create, ["podman", "secret", "create", "{name}", "{privkey_path}"])
            .with(Action::Remove, ["podman", "secret", "rm", "{name}"])
    }

    fn host(runner: &Arc<RecordingRunner>) -> Arc<dyn Host> {
        Arc::new(LocalHost::new(runner.clone(), "podman"))
    }

    fn ctx() -> RunContext {
        RunContext {
            cancel: CancellationToken::new(),
            health_timeout: Duration::from_millis(50),
            health_interval: Duration::from_millis(1),
            applied: Arc::default(),
        }
    }

    #[test]
    fn name_defaults_to_lowercased_kind() {
        let runner = Arc::new(RecordingRunner::new());
        let r = Resource::new("Secret", TemplateSet::new(), host(&runner));
        assert_eq!(r.name(), "secret");
        let r = Resource::with_name("Secret", "pr", TemplateSet::new(), host(&runner));
        assert_eq!(r.name(), "pr");
    }

    #[test]
    fn format_cmd_substitutes_placeholders() {
        let runner = Arc::new(RecordingRunner::new());
        let r = Resource::with_name("Secret", "pr", TemplateSet::new(), host(&runner));
        assert_eq!(
            r.format_cmd(&["foo", "{name}", "bar", "x{name}x"]),
            ["foo", "pr", "bar", "xprx"]
        );
    }

    #[test]
    fn unknown_placeholders_stay_as_constructed() {
        let runner = Arc::new(RecordingRunner::new());
        let r = Resource::new("Secret", TemplateSet::new(), host(&runner))
            .attr(Attr::Image, "quay.io/x:latest");
        assert_eq!(
            r.format_cmd(&["{image}", "{archive_dir}", "{bogus}"]),
            ["quay.io/x:latest", "{archive_dir}", "{bogus}"]
        );
    }

    #[test]
    fn name_attribute_cannot_be_overwritten() {
        let runner = Arc::new(RecordingRunner::new());
        let r = Resource::with_name("Secret", "pr", TemplateSet::new(), host(&runner))
            .attr(Attr::Name, "other");
        assert_eq!(r.value(Attr::Name), Some("pr"));
        assert_eq!(r.name(), "pr");
    }

    #[tokio::test]
    async fn exists_follows_inspect_exit_code() {
        for (code, expected) in [(0, true), (1, false), (125, false)] {
            let runner = Arc::new(RecordingRunner::new());
            runner.respond(["podman", "secret", "inspect"], code, "");
            let r = Resource::new("Secret", secret_templates(), host(&runner));
            assert_eq!(r.exists().await.unwrap(), expected, "exit code {code}");
        }
    }

    #[tokio::test]
    async fn missing_inspect_template_never_exists() {
        let runner = Arc::new(RecordingRunner::new());
        let r = Resource::new("Network", TemplateSet::new(), host(&runner));
        assert!(!r.exists().await.unwrap());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn create_is_a_no_op_once_the_object_exists() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(["podman", "secret", "inspect"], 1, "");
        let r = Resource::new("Secret", secret_templates(), host(&runner))
            .attr(Attr::PrivkeyPath, "/tmp/key");
        r.create().await.unwrap();
        runner.respond(["podman", "secret", "inspect"], 0, "[]");
        r.create().await.unwrap();
        assert_eq!(runner.count(&["podman", "secret", "create"]), 1);
        assert_eq!(
            runner.calls()[1],
            ["podman", "secret", "create", "secret", "/tmp/key"]
        );
    }

    #[tokio::test]
    async fn create_failure_is_raised() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(["podman", "secret", "inspect"], 1, "");
        runner.respond(["podman", "secret", "create"], 125, "");
        let r = Resource::new("Secret", secret_templates(), host(&runner));
        let err = r.create().await.unwrap_err();
        assert!(matches!(err, DevstackError::ProcessFailed { code: 125, .. }));
    }

    #[tokio::test]
    async fn remove_failure_is_swallowed() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(["podman", "secret", "rm"], 1, "");
        let r = Resource::new("Secret", secret_templates(), host(&runner));
        r.remove().await;
        assert_eq!(runner.count(&["podman", "secret", "rm"]), 1);
    }

    #[tokio::test]
    async fn is_running_compares_status_case_insensitively() {
        let cases = [
            (0, r#"[{"State": {"Status": "Running"}}]"#, true),
            (0, r#"[{"State": {"Status": "running"}}]"#, true),
            (0, r#"[{"State": {"Status": "crashed"}}]"#, false),
            (0, "[]", false),
            (1, "", false),
        ];
        for (code, stdout, expected) in cases {
            let runner = Arc::new(RecordingRunner::new());
            runner.respond(["podman", "secret", "inspect"], code, stdout);
            let r = Resource::new("Secret", secret_templates(), host(&runner));
            assert_eq!(r.is_running().await.unwrap(), expected, "{stdout}");
        }
    }

    #[tokio::test]
    async fn health_polling_times_out() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(["podman", "healthcheck", "run"], 1, "");
        let templates = TemplateSet::new()
            .with(Action::Create, ["podman", "container", "create", "--health-cmd", "true", "{name}"])
            .with(Action::Start, ["podman", "container", "start", "{name}"]);
        let r = Resource::with_name("Container", "paddles", templates, host(&runner));
        let err = r.start(&ctx()).await.unwrap_err();
        assert!(matches!(err, DevstackError::HealthCheckTimeout { name, .. } if name == "paddles"));
        assert!(runner.count(&["podman", "healthcheck", "run", "paddles"]) >= 1);
    }

    #[tokio::test]
    async fn health_polling_honours_cancellation() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(["podman", "healthcheck", "run"], 1, "");
        let templates = TemplateSet::new()
            .with(Action::Create, ["podman", "container", "create", "--health-cmd", "true", "{name}"])
            .with(Action::Start, ["podman", "container", "start", "{name}"]);
        let r = Resource::with_name("Container", "paddles", templates, host(&runner));
        let mut ctx = ctx();
        ctx.health_timeout = Duration::from_secs(3600);
        ctx.health_interval = Duration::from_secs(3600);
        ctx.cancel.cancel();
        let err = r.start(&ctx).await.unwrap_err();
        assert!(matches!(err, DevstackError::Cancelled));
    }

    #[tokio::test]
    async fn apply_skips_repeated_create_and_forgets_on_remove() {
        let runner = Arc::new(RecordingRunner::new().with_default_code(1));
        runner.respond(["podman", "secret", "create"], 0, "");
        runner.respond(["podman", "secret", "rm"], 0, "");
        let r = Resource::new("Secret", secret_templates(), host(&runner));
        let ctx = ctx();
        apply(&r, Action::Create, &ctx).await.unwrap();
        apply(&r, Action::Create, &ctx).await.unwrap();
        assert_eq!(runner.count(&["podman", "secret", "inspect"]), 1);
        apply(&r, Action::Remove, &ctx).await.unwrap();
        assert!(!ctx.applied.contains("secret", Action::Create));
        apply(&r, Action::Create, &ctx).await.unwrap();
        assert_eq!(runner.count(&["podman", "secret", "create"]), 2);
    }
}
