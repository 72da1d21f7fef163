//! The whole topology: which replicas exist, how they are wired to each
//! other, and the order operations touch them in.

use std::sync::Arc;
use std::time::Duration;

use devstack_common::config::DevstackConfig;
use devstack_common::constants::{NETWORK_NAME, TESTNODE_COUNT_LABEL, WEB_UI_PORT};
use devstack_common::error::{DevstackError, Result};
use devstack_common::types::{Action, ServiceKind};
use devstack_core::exec::Command;
use devstack_core::host::Host;
use futures::future::join_all;

use crate::container::Container;
use crate::loop_device::LoopDevice;
use crate::misc::network;
use crate::resource::{Attr, Lifecycle, Resource, RunContext, apply};
use crate::services::{ServiceDefinition, paddles_url, postgres_url};
use crate::ssh_key::SshKeyPair;
use crate::watch;

/// Every replica of one service.
#[derive(Debug, Clone)]
pub struct Service {
    /// Which service.
    pub kind: ServiceKind,
    /// Replicas in index order.
    pub replicas: Vec<Container>,
    /// Whether the image comes from a configured checkout and is never
    /// pulled.
    pub from_source: bool,
    /// Whether the image can be built, from a checkout or bundled sources.
    pub buildable: bool,
}

/// Resolved topology for one run.
#[derive(Debug)]
pub struct Topology {
    host: Arc<dyn Host>,
    network: Resource,
    key_pair: SshKeyPair,
    services: Vec<Service>,
}

fn teuthology_probe(config: &DevstackConfig, host: &Arc<dyn Host>) -> Resource {
    let def = ServiceDefinition::of(ServiceKind::Teuthology, &config.source_dir);
    Resource::with_name(
        "Container",
        ServiceKind::Teuthology.base_name(),
        def.templates(host.engine(), &[]),
        Arc::clone(host),
    )
}

/// Test-node count recorded on an existing orchestration container.
async fn recorded_testnode_count(probe: &Resource) -> Option<u32> {
    let value = probe.inspect().await.ok()?;
    let label = value
        .pointer(&format!("/0/Config/Labels/{TESTNODE_COUNT_LABEL}"))?
        .as_str()?;
    label.parse().ok()
}

async fn current_branch(host: &dyn Host, repo: &std::path::Path) -> Option<String> {
    let repo = repo.display().to_string();
    let command = Command::new(["git", "-C", repo.as_str(), "branch", "--show-current"]);
    match host.runner().run(&command).await {
        Ok(output) if output.success() => {
            let branch = output.stdout.trim();
            (!branch.is_empty()).then(|| branch.to_string())
        }
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, "could not read teuthology branch");
            None
        }
    }
}

impl Topology {
    /// Resolves replica counts and wiring, overriding container
    /// environments from the process environment.
    pub async fn resolve(
        config: &DevstackConfig,
        host: Arc<dyn Host>,
        native_overlay: bool,
    ) -> Self {
        Self::resolve_with(config, host, native_overlay, |k| std::env::var(k).ok()).await
    }

    /// [`Topology::resolve`] with an explicit environment lookup.
    pub async fn resolve_with(
        config: &DevstackConfig,
        host: Arc<dyn Host>,
        native_overlay: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let configured = config
            .service(ServiceKind::TestNode)
            .count
            .unwrap_or_default();
        let testnodes = if config.service(ServiceKind::Teuthology).count == Some(0) {
            configured
        } else {
            let probe = teuthology_probe(config, &host);
            match recorded_testnode_count(&probe).await {
                Some(recorded) => {
                    if recorded != configured {
                        tracing::debug!(
                            recorded,
                            configured,
                            "using test node count of existing orchestrator"
                        );
                    }
                    recorded
                }
                None => configured,
            }
        };

        let counts: Vec<(ServiceKind, u32)> = ServiceKind::ALL
            .into_iter()
            .map(|kind| {
                let count = if kind == ServiceKind::TestNode {
                    testnodes
                } else {
                    config.service(kind).count.unwrap_or(1)
                };
                (kind, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();
        let first = |kind: ServiceKind| {
            counts
                .iter()
                .find(|(k, _)| *k == kind)
                .and_then(|(k, n)| k.replica_names(*n).into_iter().next())
        };
        let postgres = first(ServiceKind::Postgres);
        let paddles = first(ServiceKind::Paddles);
        let testnode_names = ServiceKind::TestNode.replica_names(testnodes);

        let teuthology_repo = config.service(ServiceKind::Teuthology).repo;
        let branch = match lookup("TEUTHOLOGY_BRANCH") {
            Some(branch) => Some(branch),
            None => match &teuthology_repo {
                Some(repo) => current_branch(host.as_ref(), repo).await,
                None => None,
            },
        };

        let storage_conf =
            (!native_overlay).then(|| config.source_dir.join("podman_config/storage.conf"));
        let mut services = Vec::with_capacity(counts.len());
        for (kind, count) in counts {
            let settings = config.service(kind);
            let def = ServiceDefinition::of(kind, &config.source_dir);
            let mut env = def.env.clone();
            match kind {
                ServiceKind::Paddles => {
                    if let Some(pg) = &postgres {
                        env.set("PADDLES_SQLALCHEMY_URL", postgres_url(pg));
                    }
                }
                ServiceKind::Pulpito => {
                    if let Some(p) = &paddles {
                        env.set("PULPITO_PADDLES_ADDRESS", paddles_url(p));
                    }
                }
                ServiceKind::Teuthology => {
                    if let Some(p) = &paddles {
                        env.set("PADDLES_URL", paddles_url(p));
                    }
                    env.set("TESTNODES", testnode_names.join(","));
                    if let Some(branch) = &branch {
                        env.set("TEUTH_BRANCH", branch.as_str());
                    }
                }
                _ => {}
            }
            let env = env.with_overrides(&lookup);

            let per_replica = settings.loop_device_count.unwrap_or_default();
            let size_gb = settings.loop_device_size_gb.unwrap_or(5);
            let mut replicas = Vec::new();
            for (ordinal, name) in (0_u32..).zip(kind.replica_names(count)) {
                let mut extra = Vec::new();
                let mut devices = Vec::new();
                if kind == ServiceKind::TestNode {
                    for slot in 0..per_replica {
                        let device = LoopDevice::for_replica(
                            &name,
                            ordinal,
                            per_replica,
                            slot,
                            &config.disk_image_dir(),
                            size_gb,
                        );
                        extra.push("--device".to_string());
                        extra.push(device.device().display().to_string());
                        devices.push(device);
                    }
                }
                if kind == ServiceKind::Teuthology {
                    extra.push("--label".into());
                    extra.push(format!("{TESTNODE_COUNT_LABEL}={testnodes}"));
                }
                let mut resource = Resource::with_name(
                    "Container",
                    name,
                    def.templates(host.engine(), &extra),
                    Arc::clone(&host),
                )
                .attr(Attr::ArchiveDir, config.archive_dir().display().to_string())
                .attr(Attr::DataDir, config.data_dir.display().to_string())
                .attr(Attr::SourceDir, config.source_dir.display().to_string());
                if let Some(image) = &settings.image {
                    resource = resource.attr(Attr::Image, image.as_str());
                }
                let context = settings
                    .repo
                    .as_ref()
                    .map(|repo| repo.display().to_string())
                    .or_else(|| def.bundled_context.clone());
                if let Some(context) = context {
                    resource = resource.attr(Attr::Repo, context);
                }
                let mut container = Container::new(resource, env.clone())
                    .with_storage_conf(storage_conf.clone())
                    .with_loop_devices(devices);
                if def.needs_archive_dir {
                    container = container.with_dir(config.archive_dir());
                }
                replicas.push(container);
            }
            services.push(Service {
                kind,
                replicas,
                from_source: settings.repo.is_some(),
                buildable: settings.repo.is_some() || def.bundled_context.is_some(),
            });
        }

        Self {
            network: network(NETWORK_NAME, Arc::clone(&host)),
            key_pair: SshKeyPair::new(config.ssh_privkey_path.clone(), Arc::clone(&host)),
            host,
            services,
        }
    }

    /// Services with at least one replica, in topology order.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Every replica, in topology order.
    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.services.iter().flat_map(|s| s.replicas.iter())
    }

    /// Replica called `name`.
    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers().find(|c| c.name() == name)
    }

    /// Dispatches `action`.
    ///
    /// # Errors
    ///
    /// Propagates the operation's error.
    pub async fn apply(&self, action: Action, ctx: &RunContext) -> Result<()> {
        match action {
            Action::Pull => self.pull(ctx).await,
            Action::Build => self.build(ctx).await,
            Action::Create => self.create(ctx).await,
            Action::Start => self.start(ctx).await,
            Action::Stop => {
                self.stop(ctx).await;
                Ok(())
            }
            Action::Remove => {
                self.remove(ctx).await;
                Ok(())
            }
        }
    }

    /// Pulls one image per service not built from source.
    ///
    /// # Errors
    ///
    /// Returns the first failed pull.
    pub async fn pull(&self, ctx: &RunContext) -> Result<()> {
        tracing::info!("pulling images");
        for service in self.services.iter().filter(|s| !s.from_source) {
            if let Some(replica) = service.replicas.first() {
                apply(replica, Action::Pull, ctx).await?;
            }
        }
        Ok(())
    }

    /// Builds one image per service with a checkout or bundled sources.
    ///
    /// # Errors
    ///
    /// Returns the first failed build.
    pub async fn build(&self, ctx: &RunContext) -> Result<()> {
        tracing::info!("building images");
        for service in self.services.iter().filter(|s| s.buildable) {
            if let Some(replica) = service.replicas.first() {
                apply(replica, Action::Build, ctx).await?;
            }
        }
        Ok(())
    }

    /// Creates the network and key pair, then every replica concurrently.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the remaining replicas are still
    /// attempted.
    pub async fn create(&self, ctx: &RunContext) -> Result<()> {
        tracing::info!("creating containers");
        apply(&self.network, Action::Create, ctx).await?;
        apply(&self.key_pair, Action::Create, ctx).await?;
        let results = join_all(self.containers().map(|c| apply(c, Action::Create, ctx))).await;
        let mut first = None;
        for (container, result) in self.containers().zip(results) {
            if let Err(e) = result {
                tracing::error!(name = %container.name(), error = %e, "create failed");
                let _ = first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Creates anything missing, then starts every replica in topology
    /// order.
    ///
    /// # Errors
    ///
    /// Returns the first failure, including `HealthCheckTimeout` and
    /// `Cancelled`.
    pub async fn start(&self, ctx: &RunContext) -> Result<()> {
        self.create(ctx).await?;
        tracing::info!("starting containers");
        for container in self.containers() {
            apply(container, Action::Start, ctx).await?;
        }
        let hostname = self.host.hostname().await;
        tracing::info!("View test results at http://{hostname}:{WEB_UI_PORT}/");
        Ok(())
    }

    /// Stops every replica concurrently. Failures are logged.
    pub async fn stop(&self, ctx: &RunContext) {
        tracing::info!("stopping containers");
        let results = join_all(self.containers().map(|c| apply(c, Action::Stop, ctx))).await;
        for (container, result) in self.containers().zip(results) {
            if let Err(e) = result {
                tracing::warn!(name = %container.name(), error = %e, "stop failed");
            }
        }
    }

    /// Removes every replica concurrently, then the key pair and network.
    /// Failures are logged.
    pub async fn remove(&self, ctx: &RunContext) {
        tracing::info!("removing containers");
        let results = join_all(self.containers().map(|c| apply(c, Action::Remove, ctx))).await;
        for (container, result) in self.containers().zip(results) {
            if let Err(e) = result {
                tracing::warn!(name = %container.name(), error = %e, "remove failed");
            }
        }
        for target in [&self.key_pair as &dyn Lifecycle, &self.network] {
            if let Err(e) = apply(target, Action::Remove, ctx).await {
                tracing::warn!(name = %target.name(), error = %e, "remove failed");
            }
        }
    }

    /// Waits for replica `name` to exit and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no replica has that name.
    pub async fn wait(&self, name: &str) -> Result<i32> {
        let container = self.container(name).ok_or_else(|| DevstackError::NotFound {
            kind: "container",
            id: name.to_string(),
        })?;
        container.wait().await
    }

    /// Keeps every replica running until `ctx.cancel` fires.
    pub async fn watch(&self, ctx: &RunContext, interval: Duration) {
        let targets: Vec<&dyn Lifecycle> =
            self.containers().map(|c| c as &dyn Lifecycle).collect();
        watch::watch(&targets, ctx, interval).await;
    }
}
