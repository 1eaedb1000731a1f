//! In-memory cluster for tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use chanop_core::gvk_key;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::Scope;
use kube::ResourceExt;

use crate::{ClusterApi, ClusterError};

type Key = (String, Option<String>, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    created: Vec<Key>,
    fail_get: HashSet<String>,
    fail_create: HashSet<String>,
}

/// Serves a fixed set of kinds and keeps created objects in a map. Records create order.
pub struct MemoryCluster {
    kinds: HashMap<GroupVersionKind, Scope>,
    state: Mutex<State>,
}

fn gvk(group: &str, version: &str, kind: &str) -> GroupVersionKind {
    GroupVersionKind { group: group.into(), version: version.into(), kind: kind.into() }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        let mut kinds = HashMap::new();
        for (g, v, k) in [("", "v1", "ServiceAccount"), ("", "v1", "ConfigMap"), ("", "v1", "Secret"), ("", "v1", "Service"), ("apps", "v1", "Deployment")] {
            kinds.insert(gvk(g, v, k), Scope::Namespaced);
        }
        for v in ["v1", "v1beta1"] {
            kinds.insert(gvk("rbac.authorization.k8s.io", v, "Role"), Scope::Namespaced);
            kinds.insert(gvk("rbac.authorization.k8s.io", v, "RoleBinding"), Scope::Namespaced);
            kinds.insert(gvk("rbac.authorization.k8s.io", v, "ClusterRole"), Scope::Cluster);
            kinds.insert(gvk("rbac.authorization.k8s.io", v, "ClusterRoleBinding"), Scope::Cluster);
            kinds.insert(gvk("apiextensions.k8s.io", v, "CustomResourceDefinition"), Scope::Cluster);
        }
        kinds.insert(gvk("", "v1", "Namespace"), Scope::Cluster);
        Self { kinds, state: Mutex::new(State::default()) }
    }
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    pub fn serve(mut self, gvk: GroupVersionKind, scope: Scope) -> Self {
        self.kinds.insert(gvk, scope);
        self
    }

    fn key(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Key {
        (gvk_key(gvk), namespace.map(str::to_string), name.to_string())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed an object without counting it as created.
    pub fn insert(&self, gvk: &GroupVersionKind, obj: DynamicObject) {
        let key = Self::key(gvk, obj.namespace().as_deref(), &obj.name_any());
        self.lock().objects.insert(key, obj);
    }

    pub fn object(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        self.lock().objects.get(&Self::key(gvk, namespace, name)).cloned()
    }

    pub fn objects(&self) -> Vec<DynamicObject> {
        self.lock().objects.values().cloned().collect()
    }

    /// `(gvk key, namespace, name)` of every successful create, in order.
    pub fn created(&self) -> Vec<(String, Option<String>, String)> {
        self.lock().created.clone()
    }

    pub fn create_count(&self) -> usize { self.lock().created.len() }

    /// Make lookups of objects named `name` fail.
    pub fn fail_get(&self, name: &str) { self.lock().fail_get.insert(name.to_string()); }

    /// Make creates of objects named `name` fail.
    pub fn fail_create(&self, name: &str) { self.lock().fail_create.insert(name.to_string()); }
}

#[async_trait::async_trait]
impl ClusterApi for MemoryCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<Scope>, ClusterError> {
        Ok(self.kinds.get(gvk).cloned())
    }

    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, ClusterError> {
        let st = self.lock();
        if st.fail_get.contains(name) {
            return Err(ClusterError::Other(format!("injected get failure for {}", name)));
        }
        Ok(st.objects.get(&Self::key(gvk, namespace, name)).cloned())
    }

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<(), ClusterError> {
        let name = obj.name_any();
        let mut st = self.lock();
        if st.fail_create.contains(&name) {
            return Err(ClusterError::Other(format!("injected create failure for {}", name)));
        }
        let key = Self::key(gvk, obj.namespace().as_deref(), &name);
        if st.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists);
        }
        let mut stored = obj.clone();
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        st.objects.insert(key.clone(), stored);
        st.created.push(key);
        Ok(())
    }
}
