//! chanop kubehub: kube client construction and API discovery.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, Result};
use kube::{
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Process-wide kube client built from kubeconfig or the in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client") })
        .await?;
    Ok(client.clone())
}

/// A served kind resolved through discovery.
#[derive(Debug, Clone)]
pub struct ResolvedKind {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// Discovery results cached per process. A miss triggers one re-run, so kinds
/// registered by earlier manifests (CRDs) become resolvable.
pub struct Catalog {
    client: Client,
    kinds: RwLock<HashMap<GroupVersionKind, ResolvedKind>>,
}

impl Catalog {
    pub fn new(client: Client) -> Self {
        Self { client, kinds: RwLock::new(HashMap::new()) }
    }

    pub fn client(&self) -> &Client { &self.client }

    /// Resolve a GVK. `Ok(None)` means the cluster does not serve it.
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ResolvedKind>> {
        if let Some(hit) = self.kinds.read().await.get(gvk) {
            return Ok(Some(hit.clone()));
        }
        counter!("discovery_refresh_total", 1u64);
        let discovery = Discovery::new(self.client.clone()).run().await.context("running api discovery")?;
        let mut kinds = self.kinds.write().await;
        kinds.clear();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let key = GroupVersionKind { group: ar.group.clone(), version: ar.version.clone(), kind: ar.kind.clone() };
                    kinds.insert(key, ResolvedKind { resource: ar, namespaced: matches!(caps.scope, Scope::Namespaced) });
                }
            }
        }
        info!(kinds = kinds.len(), "discovery refreshed");
        let found = kinds.get(gvk).cloned();
        if found.is_none() {
            debug!(gvk = %chanop_core::gvk_key(gvk), "kind not served");
        }
        Ok(found)
    }
}
