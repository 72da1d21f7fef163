//! Keeps containers alive: anything found missing is recreated, anything
//! found stopped is started again.

use std::fmt;
use std::time::Duration;

use devstack_common::error::Result;
use devstack_common::types::Action;

use crate::resource::{Lifecycle, RunContext, apply};

/// What one pass saw for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// Unknown to the engine.
    Absent,
    /// Exists but is not running.
    Stopped,
    /// Running.
    Running,
}

impl fmt::Display for Observed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absent => "absent",
            Self::Stopped => "stopped",
            Self::Running => "running",
        })
    }
}

/// Probes `target`.
///
/// # Errors
///
/// Returns an error if either probe cannot run.
pub async fn observe(target: &dyn Lifecycle) -> Result<Observed> {
    if !target.exists().await? {
        return Ok(Observed::Absent);
    }
    if target.is_running().await? {
        Ok(Observed::Running)
    } else {
        Ok(Observed::Stopped)
    }
}

async fn reconcile(target: &dyn Lifecycle, ctx: &RunContext) -> Result<Observed> {
    let observed = observe(target).await?;
    match observed {
        Observed::Running => {}
        Observed::Absent => {
            tracing::info!(name = %target.name(), "container is gone; recreating");
            ctx.applied.forget(target.name());
            apply(target, Action::Create, ctx).await?;
            apply(target, Action::Start, ctx).await?;
        }
        Observed::Stopped => {
            tracing::info!(name = %target.name(), "container stopped; starting");
            apply(target, Action::Start, ctx).await?;
        }
    }
    Ok(observed)
}

/// One reconciliation pass over `targets`. Failures are logged per target
/// and never abort the pass.
pub async fn reconcile_once(targets: &[&dyn Lifecycle], ctx: &RunContext) -> Vec<Option<Observed>> {
    let mut seen = Vec::with_capacity(targets.len());
    for target in targets {
        match reconcile(*target, ctx).await {
            Ok(observed) => seen.push(Some(observed)),
            Err(e) => {
                tracing::warn!(name = %target.name(), error = %e, "could not reconcile");
                seen.push(None);
            }
        }
    }
    seen
}

/// Reconciles `targets` every `interval` until `ctx.cancel` fires.
pub async fn watch(targets: &[&dyn Lifecycle], ctx: &RunContext, interval: Duration) {
    tracing::info!("watching containers; will replace any that are stopped");
    while !ctx.cancel.is_cancelled() {
        let _ = reconcile_once(targets, ctx).await;
        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    tracing::info!("stopped watching");
}
