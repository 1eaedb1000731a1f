use std::io::Write;

use chanop_apply::MemoryCluster;
use chanop_channel::{DecodeLimits, FetchConfig, HttpChannelReader};
use chanop_core::{Channel, ChannelSet, ChannelSetSpec, SpecKey, APP_LABEL};
use chanop_reconcile::{MemorySpecs, Outcome, ReconcileError, Reconciler, Summary};
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ROLE_BINDING: &str = "apiVersion: rbac.authorization.k8s.io/v1
kind: RoleBinding
metadata:
  name: a-operator
  namespace: default
subjects:
- kind: ServiceAccount
  name: a-operator
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: Role
  name: a-operator
";

const SERVICE_ACCOUNT: &str = "apiVersion: v1
kind: ServiceAccount
metadata:
  name: a-operator
  namespace: default
";

const CONFIG_MAP: &str = "apiVersion: v1
kind: ConfigMap
metadata:
  name: b-settings
data:
  mode: fast
";

fn bundle(files: &[(&str, &str)]) -> Vec<u8> {
    let mut b = tar::Builder::new(Vec::new());
    for (p, body) in files {
        let mut h = tar::Header::new_gnu();
        h.set_size(body.len() as u64);
        h.set_mode(0o644);
        b.append_data(&mut h, p, body.as_bytes()).unwrap();
    }
    let raw = b.into_inner().unwrap();
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(&raw).unwrap();
    gz.finish().unwrap()
}

async fn mount(server: &MockServer, at: &str, status: u16, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(status).set_body_bytes(body))
        .mount(server)
        .await;
}

fn channel(name: &str, url: String) -> Channel {
    Channel { name: name.into(), url, version: "1.2.3".into(), replicas: None }
}

fn channel_set(channels: Vec<Channel>) -> ChannelSet {
    let mut cs = ChannelSet::new("operators", ChannelSetSpec { channels });
    cs.metadata.namespace = Some("team".into());
    cs.metadata.uid = Some("uid-operators".into());
    cs
}

fn key() -> SpecKey {
    SpecKey::new("team", "operators")
}

fn gvk(group: &str, version: &str, kind: &str) -> GroupVersionKind {
    GroupVersionKind { group: group.into(), version: version.into(), kind: kind.into() }
}

type Engine = Reconciler<MemorySpecs, MemoryCluster, HttpChannelReader>;

fn engine(set: Option<ChannelSet>) -> Engine {
    let specs = MemorySpecs::new();
    if let Some(set) = set {
        specs.insert(set);
    }
    let cfg = FetchConfig::default();
    let reader = HttpChannelReader::new(cfg.build_client().unwrap(), cfg, DecodeLimits::default());
    Reconciler::new(specs, MemoryCluster::new(), reader)
}

#[tokio::test]
async fn absent_channel_set_is_a_no_op() {
    let e = engine(None);
    let out = e.reconcile(&key()).await.unwrap();
    assert_eq!(out, Outcome::Done(Summary::default()));
    assert_eq!(e.cluster().create_count(), 0);
}

#[tokio::test]
async fn empty_channel_list_completes() {
    let e = engine(Some(channel_set(Vec::new())));
    let out = e.reconcile(&key()).await.unwrap();
    assert_eq!(out, Outcome::Done(Summary::default()));
    assert_eq!(e.cluster().create_count(), 0);
}

#[tokio::test]
async fn valid_bundle_creates_in_file_order_and_is_idempotent() {
    let server = MockServer::start().await;
    mount(&server, "/a.tar.gz", 200, bundle(&[("a-rolebinding.yaml", ROLE_BINDING), ("b-serviceaccount.yaml", SERVICE_ACCOUNT)])).await;
    let e = engine(Some(channel_set(vec![channel("a-operator", format!("{}/a.tar.gz", server.uri()))])));

    let out = e.reconcile(&key()).await.unwrap();
    assert_eq!(out, Outcome::Done(Summary { channels: 1, created: 2, existing: 0 }));
    let created = e.cluster().created();
    assert_eq!(created[0].0, "rbac.authorization.k8s.io/v1/RoleBinding");
    assert_eq!(created[1].0, "v1/ServiceAccount");

    let sa = e.cluster().object(&gvk("", "v1", "ServiceAccount"), Some("default"), "a-operator").unwrap();
    assert_eq!(sa.labels().get(APP_LABEL).map(String::as_str), Some("a-operator"));
    let refs = sa.owner_references();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].uid, "uid-operators");
    assert_eq!(refs[0].kind, "ChannelSet");

    let again = e.reconcile(&key()).await.unwrap();
    assert_eq!(again, Outcome::Done(Summary { channels: 1, created: 0, existing: 2 }));
    assert_eq!(e.cluster().create_count(), 2);
}

#[tokio::test]
async fn namespace_defaults_to_the_channel_set() {
    let server = MockServer::start().await;
    mount(&server, "/b.tar.gz", 200, bundle(&[("cm.yaml", CONFIG_MAP)])).await;
    let e = engine(Some(channel_set(vec![channel("b", format!("{}/b.tar.gz", server.uri()))])));
    e.reconcile(&key()).await.unwrap();
    assert!(e.cluster().object(&gvk("", "v1", "ConfigMap"), Some("team"), "b-settings").is_some());
}

#[tokio::test]
async fn server_error_is_fatal_and_creates_nothing() {
    let server = MockServer::start().await;
    mount(&server, "/a.tar.gz", 500, Vec::new()).await;
    let e = engine(Some(channel_set(vec![channel("a-operator", format!("{}/a.tar.gz", server.uri()))])));
    let err = e.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Channel { .. }), "{err}");
    assert!(!err.is_transient());
    assert_eq!(e.cluster().create_count(), 0);
}

#[tokio::test]
async fn empty_body_requeues_without_error() {
    let server = MockServer::start().await;
    mount(&server, "/a.tar.gz", 200, Vec::new()).await;
    let e = engine(Some(channel_set(vec![channel("a-operator", format!("{}/a.tar.gz", server.uri()))])));
    let out = e.reconcile(&key()).await.unwrap();
    assert!(out.requeue());
    assert_eq!(e.cluster().create_count(), 0);
}

#[tokio::test]
async fn requeue_stops_before_later_channels() {
    let server = MockServer::start().await;
    mount(&server, "/a.tar.gz", 200, Vec::new()).await;
    mount(&server, "/b.tar.gz", 200, bundle(&[("cm.yaml", CONFIG_MAP)])).await;
    let e = engine(Some(channel_set(vec![
        channel("a", format!("{}/a.tar.gz", server.uri())),
        channel("b", format!("{}/b.tar.gz", server.uri())),
    ])));
    assert!(e.reconcile(&key()).await.unwrap().requeue());
    assert_eq!(e.cluster().create_count(), 0);
}

#[tokio::test]
async fn empty_archive_completes_with_nothing_created() {
    let server = MockServer::start().await;
    mount(&server, "/a.tar.gz", 200, bundle(&[])).await;
    let e = engine(Some(channel_set(vec![channel("a-operator", format!("{}/a.tar.gz", server.uri()))])));
    let out = e.reconcile(&key()).await.unwrap();
    assert_eq!(out, Outcome::Done(Summary { channels: 1, created: 0, existing: 0 }));
}

#[tokio::test]
async fn fatal_channel_aborts_later_channels() {
    let server = MockServer::start().await;
    mount(&server, "/a.tar.gz", 404, Vec::new()).await;
    mount(&server, "/b.tar.gz", 200, bundle(&[("cm.yaml", CONFIG_MAP)])).await;
    let e = engine(Some(channel_set(vec![
        channel("a", format!("{}/a.tar.gz", server.uri())),
        channel("b", format!("{}/b.tar.gz", server.uri())),
    ])));
    let err = e.reconcile(&key()).await.unwrap_err();
    assert!(matches!(&err, ReconcileError::Channel { channel, .. } if channel == "a"), "{err}");
    assert_eq!(e.cluster().create_count(), 0);
}

#[tokio::test]
async fn earlier_channels_stay_applied_when_a_later_one_fails() {
    let server = MockServer::start().await;
    mount(&server, "/a.tar.gz", 200, bundle(&[("sa.yaml", SERVICE_ACCOUNT)])).await;
    mount(&server, "/b.tar.gz", 200, bundle(&[("bad.yaml", "kind: ConfigMap\nmetadata:\n  name: x\n")])).await;
    let e = engine(Some(channel_set(vec![
        channel("a", format!("{}/a.tar.gz", server.uri())),
        channel("b", format!("{}/b.tar.gz", server.uri())),
    ])));
    let err = e.reconcile(&key()).await.unwrap_err();
    assert!(matches!(&err, ReconcileError::Channel { channel, .. } if channel == "b"), "{err}");
    assert_eq!(e.cluster().create_count(), 1);
}

#[tokio::test]
async fn create_and_lookup_failures_are_fatal() {
    let server = MockServer::start().await;
    mount(&server, "/a.tar.gz", 200, bundle(&[("a.yaml", ROLE_BINDING), ("b.yaml", CONFIG_MAP)])).await;
    let url = format!("{}/a.tar.gz", server.uri());

    let e = engine(Some(channel_set(vec![channel("a-operator", url.clone())])));
    e.cluster().fail_create("a-operator");
    let err = e.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Apply { .. }), "{err}");
    assert!(!err.is_transient());
    assert_eq!(e.cluster().create_count(), 0);

    let e = engine(Some(channel_set(vec![channel("a-operator", url)])));
    e.cluster().fail_get("b-settings");
    let err = e.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Apply { .. }), "{err}");
    assert_eq!(e.cluster().create_count(), 1);
}

#[tokio::test]
async fn existing_objects_are_skipped() {
    let server = MockServer::start().await;
    mount(&server, "/a.tar.gz", 200, bundle(&[("a.yaml", ROLE_BINDING), ("b.yaml", SERVICE_ACCOUNT)])).await;
    let e = engine(Some(channel_set(vec![channel("a-operator", format!("{}/a.tar.gz", server.uri()))])));
    let pre = chanop_core::DecodedResource::from_json(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": { "name": "a-operator", "namespace": "default" }
    }))
    .unwrap();
    let pre_gvk = pre.gvk().clone();
    e.cluster().insert(&pre_gvk, pre.into_object());

    let out = e.reconcile(&key()).await.unwrap();
    assert_eq!(out, Outcome::Done(Summary { channels: 1, created: 1, existing: 1 }));
    let sa = e.cluster().object(&gvk("", "v1", "ServiceAccount"), Some("default"), "a-operator").unwrap();
    assert!(sa.owner_references().is_empty());
}

#[tokio::test]
async fn deleted_channel_set_stops_applying() {
    let server = MockServer::start().await;
    mount(&server, "/b.tar.gz", 200, bundle(&[("cm.yaml", CONFIG_MAP)])).await;
    let e = engine(Some(channel_set(vec![channel("b", format!("{}/b.tar.gz", server.uri()))])));
    assert_eq!(e.reconcile(&key()).await.unwrap(), Outcome::Done(Summary { channels: 1, created: 1, existing: 0 }));
    assert!(e.specs().remove(&key()).is_some());
    assert_eq!(e.reconcile(&key()).await.unwrap(), Outcome::Done(Summary::default()));
    assert_eq!(e.cluster().create_count(), 1);
}

#[tokio::test]
async fn spec_lookup_failure_is_transient() {
    let e = engine(Some(channel_set(Vec::new())));
    e.specs().set_failing(true);
    let err = e.reconcile(&key()).await.unwrap_err();
    assert!(err.is_transient());
    e.specs().set_failing(false);
    assert!(!e.reconcile(&key()).await.unwrap().requeue());
}

#[tokio::test]
async fn duplicate_channel_names_are_rejected() {
    let e = engine(Some(channel_set(vec![
        channel("a", "http://127.0.0.1:1/a".into()),
        channel("a", "http://127.0.0.1:1/b".into()),
    ])));
    let err = e.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::DuplicateChannel(n) if n == "a"));
}
