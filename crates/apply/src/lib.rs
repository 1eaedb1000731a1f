//! chanop apply: stamp ownership and labels on a decoded manifest, then create it
//! unless an object with the same kind/namespace/name already exists.
//!
//! Existing objects are never updated or deleted.

#![forbid(unsafe_code)]

mod kube_cluster;
mod memory;

use chanop_core::{channel_labels, gvk_key, Channel, ChannelSet, DecodedResource, OwnerError};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::Scope;
use metrics::counter;
use tracing::{debug, info, warn};

pub use kube_cluster::KubeCluster;
pub use memory::MemoryCluster;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("already exists")]
    AlreadyExists,
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("discovery: {0}")]
    Discovery(String),
    #[error("{0}")]
    Other(String),
}

/// The slice of the cluster API the engine needs: scope lookup, get and create.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Scope of a served kind; `None` when the cluster does not serve it.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<Scope>, ClusterError>;
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, ClusterError>;
    /// Create `obj`. A conflicting existing object is reported as [`ClusterError::AlreadyExists`].
    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<(), ClusterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("setting owner reference: {0}")]
    Owner(#[from] OwnerError),
    #[error("kind {0} is not served by the cluster")]
    UnknownKind(String),
    #[error("resolving kind {kind}: {source}")]
    Resolve {
        kind: String,
        #[source]
        source: ClusterError,
    },
    #[error("looking up {kind} {name}: {source}")]
    Lookup {
        kind: String,
        name: String,
        #[source]
        source: ClusterError,
    },
    #[error("creating new {kind} {name}: {source}")]
    Create {
        kind: String,
        name: String,
        #[source]
        source: ClusterError,
    },
}

/// Apply one decoded resource on behalf of `owner`, attributing it to `channel`.
pub async fn apply_one<C: ClusterApi + ?Sized>(
    cluster: &C,
    owner: &ChannelSet,
    channel: &Channel,
    mut res: DecodedResource,
) -> Result<ApplyOutcome, ApplyError> {
    let out = apply_inner(cluster, owner, channel, &mut res).await;
    match &out {
        Ok(ApplyOutcome::Created) => counter!("apply_created_total", 1u64),
        Ok(ApplyOutcome::AlreadyExists) => counter!("apply_skipped_total", 1u64),
        Err(_) => counter!("apply_err", 1u64),
    }
    out
}

async fn apply_inner<C: ClusterApi + ?Sized>(
    cluster: &C,
    owner: &ChannelSet,
    channel: &Channel,
    res: &mut DecodedResource,
) -> Result<ApplyOutcome, ApplyError> {
    res.set_owner(owner.owner_reference()?)?;
    res.set_labels(channel_labels(channel));

    let kind = gvk_key(res.gvk());
    let scope = cluster
        .resolve(res.gvk())
        .await
        .map_err(|source| ApplyError::Resolve { kind: kind.clone(), source })?
        .ok_or_else(|| ApplyError::UnknownKind(kind.clone()))?;
    match scope {
        Scope::Namespaced if res.namespace().is_none() => res.set_namespace(owner.metadata.namespace.clone()),
        Scope::Namespaced => {}
        Scope::Cluster => res.set_namespace(None),
    }

    let name = res.name();
    let ns = res.namespace();
    if let Some(problem) = owner_mismatch(&scope, ns.as_deref(), owner.metadata.namespace.as_deref()) {
        warn!(kind = %kind, ns = ?ns, name = %name, problem, "owner reference will not hold for garbage collection");
    }
    let found = cluster
        .get(res.gvk(), ns.as_deref(), &name)
        .await
        .map_err(|source| ApplyError::Lookup { kind: kind.clone(), name: name.clone(), source })?;
    if found.is_some() {
        debug!(kind = %kind, ns = ?ns, name = %name, "already exists; leaving as is");
        return Ok(ApplyOutcome::AlreadyExists);
    }

    info!(kind = %kind, ns = ?ns, name = %name, channel = %channel.name, "creating");
    match cluster.create(res.gvk(), res.object()).await {
        Ok(()) => Ok(ApplyOutcome::Created),
        Err(ClusterError::AlreadyExists) => {
            debug!(kind = %kind, ns = ?ns, name = %name, "created concurrently; leaving as is");
            Ok(ApplyOutcome::AlreadyExists)
        }
        Err(source) => Err(ApplyError::Create { kind, name, source }),
    }
}

/// Owner references only resolve within the dependent's namespace. A dependent that
/// is cluster-scoped or lives elsewhere is not collected with its ChannelSet.
fn owner_mismatch(scope: &Scope, ns: Option<&str>, owner_ns: Option<&str>) -> Option<&'static str> {
    match scope {
        Scope::Cluster => Some("cluster-scoped dependent of a namespaced owner"),
        Scope::Namespaced if ns != owner_ns => Some("dependent outside the owner's namespace"),
        Scope::Namespaced => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanop_core::{ChannelSetSpec, APP_LABEL, CHANNEL_VERSION_LABEL};
    use kube::ResourceExt;

    fn owner() -> ChannelSet {
        let mut cs = ChannelSet::new("set", ChannelSetSpec::default());
        cs.metadata.namespace = Some("team".into());
        cs.metadata.uid = Some("0000-set".into());
        cs
    }

    fn channel() -> Channel {
        Channel { name: "a-operator".into(), url: "http://bundles/a".into(), version: "1.2.3".into(), replicas: None }
    }

    fn decoded(v: serde_json::Value) -> DecodedResource {
        DecodedResource::from_json(v).unwrap()
    }

    fn sa(ns: Option<&str>) -> DecodedResource {
        let mut v = serde_json::json!({ "apiVersion": "v1", "kind": "ServiceAccount", "metadata": { "name": "a-operator", "labels": { "keep": "me" } } });
        if let Some(ns) = ns {
            v["metadata"]["namespace"] = ns.into();
        }
        decoded(v)
    }

    fn sa_gvk() -> GroupVersionKind {
        GroupVersionKind { group: String::new(), version: "v1".into(), kind: "ServiceAccount".into() }
    }

    #[tokio::test]
    async fn creates_with_owner_and_labels() {
        let cluster = MemoryCluster::new();
        let out = apply_one(&cluster, &owner(), &channel(), sa(Some("default"))).await.unwrap();
        assert_eq!(out, ApplyOutcome::Created);
        let obj = cluster.object(&sa_gvk(), Some("default"), "a-operator").unwrap();
        let refs = obj.owner_references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "0000-set");
        assert_eq!(refs[0].name, "set");
        assert_eq!(obj.labels().get(APP_LABEL).map(String::as_str), Some("a-operator"));
        assert_eq!(obj.labels().get(CHANNEL_VERSION_LABEL).map(String::as_str), Some("1.2.3"));
        assert_eq!(obj.labels().get("keep").map(String::as_str), Some("me"));
    }

    #[tokio::test]
    async fn existing_object_is_left_untouched() {
        let cluster = MemoryCluster::new();
        cluster.insert(&sa_gvk(), sa(Some("default")).into_object());
        let out = apply_one(&cluster, &owner(), &channel(), sa(Some("default"))).await.unwrap();
        assert_eq!(out, ApplyOutcome::AlreadyExists);
        assert_eq!(cluster.create_count(), 0);
        let obj = cluster.object(&sa_gvk(), Some("default"), "a-operator").unwrap();
        assert!(obj.owner_references().is_empty());
    }

    #[tokio::test]
    async fn namespaced_kind_defaults_to_owner_namespace() {
        let cluster = MemoryCluster::new();
        apply_one(&cluster, &owner(), &channel(), sa(None)).await.unwrap();
        assert!(cluster.object(&sa_gvk(), Some("team"), "a-operator").is_some());
    }

    #[tokio::test]
    async fn cluster_scoped_kind_drops_namespace() {
        let cluster = MemoryCluster::new();
        let cr = decoded(serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": { "name": "reader", "namespace": "ignored" },
            "rules": []
        }));
        let gvk = cr.gvk().clone();
        apply_one(&cluster, &owner(), &channel(), cr).await.unwrap();
        assert!(cluster.object(&gvk, None, "reader").is_some());
    }

    #[tokio::test]
    async fn unknown_kind_is_fatal() {
        let cluster = MemoryCluster::new();
        let r = decoded(serde_json::json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "w" } }));
        let err = apply_one(&cluster, &owner(), &channel(), r).await.unwrap_err();
        assert!(matches!(err, ApplyError::UnknownKind(k) if k == "example.com/v1/Widget"));
        assert_eq!(cluster.create_count(), 0);
    }

    #[tokio::test]
    async fn extra_served_kinds_can_be_applied() {
        let widget = GroupVersionKind { group: "example.com".into(), version: "v1".into(), kind: "Widget".into() };
        let cluster = MemoryCluster::new().serve(widget, Scope::Namespaced);
        let r = decoded(serde_json::json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "w" } }));
        assert_eq!(apply_one(&cluster, &owner(), &channel(), r).await.unwrap(), ApplyOutcome::Created);
        apply_one(&cluster, &owner(), &channel(), sa(None)).await.unwrap();
        let objs = cluster.objects();
        assert_eq!(objs.len(), 2);
        assert!(objs.iter().all(|o| o.namespace().as_deref() == Some("team")));
        assert!(objs.iter().all(|o| o.uid().is_some()));
    }

    #[test]
    fn owner_mismatch_flags_unresolvable_owners() {
        assert_eq!(owner_mismatch(&Scope::Namespaced, Some("team"), Some("team")), None);
        assert!(owner_mismatch(&Scope::Namespaced, Some("default"), Some("team")).is_some());
        assert!(owner_mismatch(&Scope::Cluster, None, Some("team")).is_some());
    }

    #[tokio::test]
    async fn malformed_owner_is_fatal() {
        let cluster = MemoryCluster::new();
        let mut o = owner();
        o.metadata.uid = None;
        let err = apply_one(&cluster, &o, &channel(), sa(Some("default"))).await.unwrap_err();
        assert!(matches!(err, ApplyError::Owner(_)));
        assert_eq!(cluster.create_count(), 0);
    }

    #[tokio::test]
    async fn lookup_and_create_failures_are_fatal() {
        let cluster = MemoryCluster::new();
        cluster.fail_get("a-operator");
        let err = apply_one(&cluster, &owner(), &channel(), sa(Some("default"))).await.unwrap_err();
        assert!(matches!(err, ApplyError::Lookup { .. }));

        let cluster = MemoryCluster::new();
        cluster.fail_create("a-operator");
        let err = apply_one(&cluster, &owner(), &channel(), sa(Some("default"))).await.unwrap_err();
        assert!(matches!(err, ApplyError::Create { .. }));
        assert!(err.to_string().contains("creating new v1/ServiceAccount a-operator"), "{err}");
    }
}
