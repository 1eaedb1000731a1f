//! kube-runtime wiring: watch ChannelSets and feed their keys to the engine.

use std::sync::Arc;
use std::time::Duration;

use chanop_apply::ClusterApi;
use chanop_channel::ChannelReader;
use chanop_core::ChannelSet;
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::Api;
use tracing::{debug, info, warn};

use crate::{Outcome, ReconcileError, Reconciler, SpecSource};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Delay before retrying after a transient failure.
    pub requeue_after: Duration,
    /// Overall deadline for one reconcile; an elapsed deadline requeues.
    pub reconcile_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { requeue_after: Duration::from_secs(30), reconcile_timeout: Some(Duration::from_secs(300)) }
    }
}

struct Ctx<S, C, R> {
    engine: Reconciler<S, C, R>,
    cfg: ControllerConfig,
}

pub fn action_for(outcome: &Outcome, cfg: &ControllerConfig) -> Action {
    match outcome {
        Outcome::Done(_) => Action::await_change(),
        Outcome::Requeue { .. } => Action::requeue(cfg.requeue_after),
    }
}

pub fn action_for_error(err: &ReconcileError, cfg: &ControllerConfig) -> Action {
    if err.is_transient() {
        Action::requeue(cfg.requeue_after)
    } else {
        Action::await_change()
    }
}

async fn reconcile<S, C, R>(obj: Arc<ChannelSet>, ctx: Arc<Ctx<S, C, R>>) -> Result<Action, ReconcileError>
where
    S: SpecSource,
    C: ClusterApi,
    R: ChannelReader,
{
    let key = obj.key().ok_or_else(|| ReconcileError::InvalidObject("missing metadata.namespace or metadata.name".into()))?;
    let fut = ctx.engine.reconcile(&key);
    let outcome = match ctx.cfg.reconcile_timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(res) => res?,
            Err(_) => {
                warn!(key = %key, timeout_s = limit.as_secs(), "reconcile deadline elapsed; requeueing");
                Outcome::Requeue { reason: "deadline elapsed".into() }
            }
        },
        None => fut.await?,
    };
    Ok(action_for(&outcome, &ctx.cfg))
}

fn error_policy<S, C, R>(obj: Arc<ChannelSet>, err: &ReconcileError, ctx: Arc<Ctx<S, C, R>>) -> Action {
    warn!(name = ?obj.metadata.name, ns = ?obj.metadata.namespace, transient = err.is_transient(), error = %err, "reconcile failed");
    action_for_error(err, &ctx.cfg)
}

/// Run the controller until SIGINT/SIGTERM.
pub async fn run<S, C, R>(api: Api<ChannelSet>, engine: Reconciler<S, C, R>, cfg: ControllerConfig)
where
    S: SpecSource + 'static,
    C: ClusterApi + 'static,
    R: ChannelReader + 'static,
{
    let ctx = Arc::new(Ctx { engine, cfg });
    info!("controller started");
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile::<S, C, R>, error_policy::<S, C, R>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(object = %obj, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile dispatch failed"),
            }
        })
        .await;
    info!("controller terminated");
}
