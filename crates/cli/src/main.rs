use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chanop_apply::KubeCluster;
use chanop_channel::{ChannelReader, DecodeLimits, FetchConfig, HttpChannelReader};
use chanop_core::{gvk_key, Channel, ChannelSet, SpecKey};
use chanop_kubehub::{get_kube_client, Catalog};
use chanop_reconcile::controller::{self, ControllerConfig};
use chanop_reconcile::{KubeSpecs, Outcome, Reconciler};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kube::Api;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chanopctl", version, about = "Fetch versioned manifest bundles and create what they declare")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    fetch: FetchArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct FetchArgs {
    /// Skip TLS verification when downloading bundles
    #[arg(long = "insecure-skip-tls-verify", env = "CHANOP_INSECURE_SKIP_TLS_VERIFY", global = true, action = ArgAction::SetTrue)]
    insecure_skip_tls_verify: bool,
    /// Per-download timeout in seconds (0 disables)
    #[arg(long = "fetch-timeout-secs", env = "CHANOP_FETCH_TIMEOUT_SECS", global = true, default_value_t = 60)]
    fetch_timeout_secs: u64,
    /// Parent directory for bundle staging (default: system temp dir)
    #[arg(long = "staging-dir", env = "CHANOP_STAGING_DIR", global = true)]
    staging_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run {
        /// Watch a single namespace (default: all namespaces)
        #[arg(long = "namespace", env = "CHANOP_NAMESPACE")]
        namespace: Option<String>,
        /// Delay before retrying a transient failure
        #[arg(long = "requeue-after-secs", env = "CHANOP_REQUEUE_AFTER_SECS", default_value_t = 30)]
        requeue_after_secs: u64,
        /// Deadline for one reconciliation (0 disables)
        #[arg(long = "reconcile-timeout-secs", env = "CHANOP_RECONCILE_TIMEOUT_SECS", default_value_t = 300)]
        reconcile_timeout_secs: u64,
    },
    /// Reconcile one ChannelSet once and print the outcome
    Reconcile {
        #[arg(long = "namespace", env = "CHANOP_NAMESPACE")]
        namespace: String,
        /// ChannelSet name
        name: String,
    },
    /// Fetch and decode one channel without touching the cluster
    Read {
        #[arg(long = "name")]
        name: String,
        #[arg(long = "version")]
        version: String,
        /// Bundle URL
        url: String,
    },
}

#[derive(Serialize)]
struct ResourceRow {
    kind: String,
    namespace: Option<String>,
    name: String,
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
enum Report {
    Done { channels: usize, created: usize, existing: usize },
    Requeue { reason: String },
}

const DEFAULT_LOG: &str = "info,kube=warn";

fn log_filter(spec: Option<&str>) -> tracing_subscriber::EnvFilter {
    spec.and_then(|s| tracing_subscriber::EnvFilter::from_str(s).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new(DEFAULT_LOG))
}

fn init_tracing() {
    let spec = std::env::var("CHANOP_LOG").ok();
    tracing_subscriber::fmt().with_env_filter(log_filter(spec.as_deref())).with_target(true).init();
}

/// Serve Prometheus metrics when `CHANOP_METRICS_ADDR` names a socket address.
fn init_metrics() {
    let Ok(raw) = std::env::var("CHANOP_METRICS_ADDR") else { return };
    let sock: std::net::SocketAddr = match raw.parse() {
        Ok(sock) => sock,
        Err(e) => {
            warn!(addr = %raw, error = %e, "ignoring CHANOP_METRICS_ADDR; expected host:port");
            return;
        }
    };
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        warn!(addr = %sock, error = %e, "metrics exporter not installed");
    } else {
        info!(addr = %sock, "serving Prometheus metrics");
    }
}

fn secs(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_secs(n))
}

fn channel_reader(args: &FetchArgs) -> Result<HttpChannelReader> {
    let cfg = FetchConfig {
        insecure_skip_verify: args.insecure_skip_tls_verify,
        timeout: secs(args.fetch_timeout_secs),
        staging_dir: args.staging_dir.clone(),
        ..FetchConfig::from_env()
    };
    let client = cfg.build_client().context("building HTTP client")?;
    Ok(HttpChannelReader::new(client, cfg, DecodeLimits::from_env()))
}

async fn engine(args: &FetchArgs) -> Result<Reconciler<KubeSpecs, KubeCluster, HttpChannelReader>> {
    let client = get_kube_client().await?;
    let cluster = KubeCluster::new(Arc::new(Catalog::new(client.clone())));
    Ok(Reconciler::new(KubeSpecs::new(client), cluster, channel_reader(args)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { namespace, requeue_after_secs, reconcile_timeout_secs } => {
            info!(ns = ?namespace, "run invoked");
            let engine = engine(&cli.fetch).await?;
            let client = get_kube_client().await?;
            let api: Api<ChannelSet> = match namespace.as_deref() {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            };
            let cfg = ControllerConfig {
                requeue_after: Duration::from_secs(requeue_after_secs),
                reconcile_timeout: secs(reconcile_timeout_secs),
            };
            controller::run(api, engine, cfg).await;
        }
        Commands::Reconcile { namespace, name } => {
            let key = SpecKey::new(namespace, name);
            info!(key = %key, "reconcile invoked");
            let engine = engine(&cli.fetch).await?;
            let outcome = engine.reconcile(&key).await.with_context(|| format!("reconciling {}", key))?;
            let report = match outcome {
                Outcome::Done(s) => Report::Done { channels: s.channels, created: s.created, existing: s.existing },
                Outcome::Requeue { reason } => Report::Requeue { reason },
            };
            match cli.output {
                Output::Human => match &report {
                    Report::Done { channels, created, existing } => {
                        println!("{}: done ({} channels, {} created, {} existing)", key, channels, created, existing)
                    }
                    Report::Requeue { reason } => println!("{}: requeue ({})", key, reason),
                },
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Read { name, version, url } => {
            let channel = Channel { name, url, version, replicas: None };
            info!(channel = %channel.name, url = %channel.url, "read invoked");
            let reader = channel_reader(&cli.fetch)?;
            let objs = match reader.read(&channel).await {
                Ok(objs) => objs,
                Err(e) if e.requeue() => anyhow::bail!("retryable: {}", e),
                Err(e) => return Err(e.into()),
            };
            let rows: Vec<ResourceRow> = objs
                .iter()
                .map(|o| ResourceRow { kind: gvk_key(o.gvk()), namespace: o.namespace(), name: o.name() })
                .collect();
            match cli.output {
                Output::Human => {
                    println!("{:<40} {:<16} NAME", "KIND", "NAMESPACE");
                    for r in &rows {
                        println!("{:<40} {:<16} {}", r.kind, r.namespace.as_deref().unwrap_or("-"), r.name);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }
    Ok(())
}
