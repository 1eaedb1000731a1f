use std::sync::Arc;

use chanop_core::{gvk_key, FIELD_MANAGER};
use chanop_kubehub::{Catalog, ResolvedKind};
use kube::api::{Api, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::Scope;
use kube::ResourceExt;

use crate::{ClusterApi, ClusterError};

/// Cluster access through the kube API server, resolving kinds via discovery.
#[derive(Clone)]
pub struct KubeCluster {
    catalog: Arc<Catalog>,
}

impl KubeCluster {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    async fn lookup(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind, ClusterError> {
        self.catalog
            .resolve(gvk)
            .await
            .map_err(|e| ClusterError::Discovery(format!("{:#}", e)))?
            .ok_or_else(|| ClusterError::Discovery(format!("GVK not found: {}", gvk_key(gvk))))
    }

    fn api(&self, kind: &ResolvedKind, namespace: Option<&str>) -> Result<Api<DynamicObject>, ClusterError> {
        let client = self.catalog.client().clone();
        if !kind.namespaced {
            return Ok(Api::all_with(client, &kind.resource));
        }
        match namespace {
            Some(ns) => Ok(Api::namespaced_with(client, ns, &kind.resource)),
            None => Err(ClusterError::Other(format!("namespace required for namespaced kind {}", kind.resource.kind))),
        }
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<Scope>, ClusterError> {
        let found = self.catalog.resolve(gvk).await.map_err(|e| ClusterError::Discovery(format!("{:#}", e)))?;
        Ok(found.map(|k| if k.namespaced { Scope::Namespaced } else { Scope::Cluster }))
    }

    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, ClusterError> {
        let kind = self.lookup(gvk).await?;
        Ok(self.api(&kind, namespace)?.get_opt(name).await?)
    }

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<(), ClusterError> {
        let kind = self.lookup(gvk).await?;
        let api = self.api(&kind, obj.namespace().as_deref())?;
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        match api.create(&pp, obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 && resp.reason == "AlreadyExists" => Err(ClusterError::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }
}
