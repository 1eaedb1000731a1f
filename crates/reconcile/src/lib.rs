//! chanop reconcile: drive every channel of a ChannelSet through the channel
//! reader and apply what it yields, all-or-nothing and strictly in order.

#![forbid(unsafe_code)]

pub mod controller;
mod specs;

use std::collections::HashSet;
use std::time::Instant;

use chanop_apply::{apply_one, ApplyError, ApplyOutcome, ClusterApi};
use chanop_channel::{ChannelError, ChannelReader};
use chanop_core::SpecKey;
use metrics::{counter, histogram};
use tracing::{debug, info, info_span, warn, Instrument};

pub use specs::{KubeSpecs, MemorySpecs, SpecError, SpecSource};

/// Counts from a completed reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub channels: usize,
    pub created: usize,
    pub existing: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Everything declared is present (or the ChannelSet is gone).
    Done(Summary),
    /// A transient condition stopped the run; try again later.
    Requeue { reason: String },
}

impl Outcome {
    pub fn requeue(&self) -> bool { matches!(self, Outcome::Requeue { .. }) }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("reading ChannelSet {key}: {source}")]
    SpecLookup {
        key: SpecKey,
        #[source]
        source: SpecError,
    },
    #[error("duplicate channel name {0}")]
    DuplicateChannel(String),
    #[error("channel {channel}: {source}")]
    Channel {
        channel: String,
        #[source]
        source: ChannelError,
    },
    #[error("channel {channel}: {source}")]
    Apply {
        channel: String,
        #[source]
        source: ApplyError,
    },
    #[error("invalid ChannelSet: {0}")]
    InvalidObject(String),
}

impl ReconcileError {
    /// Only failures to read the ChannelSet itself are worth a timed retry; everything
    /// else waits for the next change.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::SpecLookup { .. })
    }
}

/// The reconciliation engine.
pub struct Reconciler<S, C, R> {
    specs: S,
    cluster: C,
    reader: R,
}

impl<S: SpecSource, C: ClusterApi, R: ChannelReader> Reconciler<S, C, R> {
    pub fn new(specs: S, cluster: C, reader: R) -> Self {
        Self { specs, cluster, reader }
    }

    pub fn cluster(&self) -> &C { &self.cluster }
    pub fn specs(&self) -> &S { &self.specs }

    /// Reconcile the ChannelSet at `key`. Safe to call repeatedly: objects that already
    /// exist are left alone, so an unchanged ChannelSet produces no further writes.
    pub async fn reconcile(&self, key: &SpecKey) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let span = info_span!("reconcile", key = %key);
        let res = self.reconcile_inner(key).instrument(span).await;
        histogram!("reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(Outcome::Requeue { .. }) => counter!("reconcile_requeue", 1u64),
            Err(_) => counter!("reconcile_err", 1u64),
            Ok(Outcome::Done(_)) => {}
        }
        res
    }

    async fn reconcile_inner(&self, key: &SpecKey) -> Result<Outcome, ReconcileError> {
        info!("reconciling ChannelSet");
        let Some(set) = self
            .specs
            .get(key)
            .await
            .map_err(|source| ReconcileError::SpecLookup { key: key.clone(), source })?
        else {
            info!("ChannelSet not found; owned objects are garbage collected by the cluster");
            return Ok(Outcome::Done(Summary::default()));
        };

        let mut seen = HashSet::new();
        for ch in &set.spec.channels {
            if !seen.insert(ch.name.as_str()) {
                return Err(ReconcileError::DuplicateChannel(ch.name.clone()));
            }
        }

        let mut summary = Summary::default();
        for (index, channel) in set.spec.channels.iter().enumerate() {
            let span = info_span!("channel", index, name = %channel.name, version = %channel.version);
            let requeue = async {
                debug!(url = %channel.url, replicas = ?channel.replicas, "processing channel");
                let objs = match self.reader.read(channel).await {
                    Ok(objs) => objs,
                    Err(e) if e.requeue() => {
                        warn!(error = %e, "transient channel failure; requeueing");
                        return Ok(Some(format!("channel {}: {}", channel.name, e)));
                    }
                    Err(source) => return Err(ReconcileError::Channel { channel: channel.name.clone(), source }),
                };
                for obj in objs {
                    match apply_one(&self.cluster, &set, channel, obj).await {
                        Ok(ApplyOutcome::Created) => summary.created += 1,
                        Ok(ApplyOutcome::AlreadyExists) => summary.existing += 1,
                        Err(source) => return Err(ReconcileError::Apply { channel: channel.name.clone(), source }),
                    }
                }
                summary.channels += 1;
                Ok(None)
            }
            .instrument(span)
            .await?;
            if let Some(reason) = requeue {
                return Ok(Outcome::Requeue { reason });
            }
        }
        info!(channels = summary.channels, created = summary.created, existing = summary.existing, "reconciled");
        Ok(Outcome::Done(summary))
    }
}
