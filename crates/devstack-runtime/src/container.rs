//! Containers: a [`Resource`] plus environment, host directories and loop
//! devices that must exist before the engine creates it.

use std::path::PathBuf;

use async_trait::async_trait;
use devstack_common::error::{DevstackError, Result};
use devstack_common::types::{Action, EnvMap};
use devstack_core::exec::Command;

use crate::loop_device::LoopDevice;
use crate::resource::{Lifecycle, Resource, RunContext};

/// One container replica.
#[derive(Debug, Clone)]
pub struct Container {
    resource: Resource,
    env: EnvMap,
    storage_conf: Option<PathBuf>,
    dirs: Vec<PathBuf>,
    loop_devices: Vec<LoopDevice>,
}

impl Container {
    /// Wraps `resource`, passing `env` to the container at creation.
    pub const fn new(resource: Resource, env: EnvMap) -> Self {
        Self {
            resource,
            env,
            storage_conf: None,
            dirs: Vec::new(),
            loop_devices: Vec::new(),
        }
    }

    /// Creates the container with `CONTAINERS_STORAGE_CONF` pointing at
    /// `path`, for hosts without native overlay support.
    #[must_use]
    pub fn with_storage_conf(mut self, path: Option<PathBuf>) -> Self {
        self.storage_conf = path;
        self
    }

    /// Host directory created before the container.
    #[must_use]
    pub fn with_dir(mut self, dir: PathBuf) -> Self {
        self.dirs.push(dir);
        self
    }

    /// Loop devices attached before creation and torn down after removal.
    #[must_use]
    pub fn with_loop_devices(mut self, devices: Vec<LoopDevice>) -> Self {
        self.loop_devices = devices;
        self
    }

    /// The underlying resource.
    pub const fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Environment passed at creation.
    pub const fn env(&self) -> &EnvMap {
        &self.env
    }

    /// Attached loop devices.
    pub fn loop_devices(&self) -> &[LoopDevice] {
        &self.loop_devices
    }

    /// The create command, with every environment variable inserted as
    /// `-e K=V` ahead of the image token.
    pub fn create_command(&self) -> Option<Command> {
        let mut argv = self.resource.argv(Action::Create)?;
        let image = argv.pop()?;
        for (key, value) in self.env.iter() {
            argv.push("-e".into());
            argv.push(format!("{key}={value}"));
        }
        argv.push(image);
        let command = Command::new(argv);
        Some(match &self.storage_conf {
            Some(conf) => command.env("CONTAINERS_STORAGE_CONF", conf.display().to_string()),
            None => command,
        })
    }

    async fn prepare(&self) -> Result<()> {
        for dir in &self.dirs {
            let dir = dir.display().to_string();
            let _ = self
                .resource
                .run_checked(Command::new(["mkdir", "-p", dir.as_str()]))
                .await?;
        }
        for device in &self.loop_devices {
            if let Err(e) = device.create(self.resource.host().as_ref()).await {
                tracing::error!(
                    name = %self.resource.name(),
                    device = %device.device().display(),
                    error = %e,
                    "could not set up loop device"
                );
            }
        }
        Ok(())
    }

    /// Waits for the container to exit.
    ///
    /// # Errors
    ///
    /// Returns `ProcessFailed` if the engine cannot wait on it, or a
    /// `Config` error if the printed exit code is not a number.
    pub async fn wait(&self) -> Result<i32> {
        let host = self.resource.host();
        let output = self
            .resource
            .run_checked(Command::new([
                host.engine(),
                "container",
                "wait",
                self.resource.name(),
            ]))
            .await?;
        let code = output.stdout.trim();
        code.parse().map_err(|_| DevstackError::Config {
            message: format!("unexpected exit code from container wait: {code:?}"),
        })
    }

    async fn run_streamed(&self, action: Action) -> Result<()> {
        let Some(argv) = self.resource.argv(action) else {
            return Ok(());
        };
        tracing::info!(name = %self.resource.name(), %action, "{}", argv.join(" "));
        let _ = self
            .resource
            .run_checked(Command::new(argv).stream_output(self.resource.name()))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for Container {
    fn name(&self) -> &str {
        self.resource.name()
    }

    async fn pull(&self, _ctx: &RunContext) -> Result<()> {
        self.run_streamed(Action::Pull).await
    }

    async fn build(&self, _ctx: &RunContext) -> Result<()> {
        self.run_streamed(Action::Build).await
    }

    async fn create(&self, _ctx: &RunContext) -> Result<()> {
        if self.resource.exists().await? {
            tracing::debug!(name = %self.resource.name(), "already exists");
            return Ok(());
        }
        let Some(command) = self.create_command() else {
            return Ok(());
        };
        self.prepare().await?;
        tracing::debug!(name = %self.resource.name(), "creating");
        let _ = self.resource.run_checked(command).await?;
        tracing::debug!(name = %self.resource.name(), "created");
        Ok(())
    }

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        self.resource.start(ctx).await
    }

    async fn stop(&self, _ctx: &RunContext) -> Result<()> {
        self.resource.stop().await
    }

    async fn remove(&self, _ctx: &RunContext) -> Result<()> {
        self.resource.remove().await;
        for device in &self.loop_devices {
            device.remove(self.resource.host().as_ref()).await;
        }
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        self.resource.exists().await
    }

    async fn is_running(&self) -> Result<bool> {
        self.resource.is_running().await
    }
}
