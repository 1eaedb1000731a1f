use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chanop_core::{ChannelSet, SpecKey};
use kube::{Api, Client};

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("{0}")]
    Other(String),
}

/// Where the engine reads ChannelSets from. `Ok(None)` means the object is gone.
#[async_trait::async_trait]
pub trait SpecSource: Send + Sync {
    async fn get(&self, key: &SpecKey) -> Result<Option<ChannelSet>, SpecError>;
}

pub struct KubeSpecs {
    client: Client,
}

impl KubeSpecs {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl SpecSource for KubeSpecs {
    async fn get(&self, key: &SpecKey) -> Result<Option<ChannelSet>, SpecError> {
        let api: Api<ChannelSet> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }
}

/// In-memory ChannelSets for tests.
#[derive(Default)]
pub struct MemorySpecs {
    sets: Mutex<HashMap<SpecKey, ChannelSet>>,
    failing: AtomicBool,
}

impl MemorySpecs {
    pub fn new() -> Self { Self::default() }

    /// Store `set` under its own namespace/name. Sets without both are ignored.
    pub fn insert(&self, set: ChannelSet) {
        if let Some(key) = set.key() {
            self.sets.lock().unwrap_or_else(|p| p.into_inner()).insert(key, set);
        }
    }

    pub fn remove(&self, key: &SpecKey) -> Option<ChannelSet> {
        self.sets.lock().unwrap_or_else(|p| p.into_inner()).remove(key)
    }

    /// Make every lookup fail until turned off again.
    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl SpecSource for MemorySpecs {
    async fn get(&self, key: &SpecKey) -> Result<Option<ChannelSet>, SpecError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SpecError::Other("injected lookup failure".into()));
        }
        Ok(self.sets.lock().unwrap_or_else(|p| p.into_inner()).get(key).cloned())
    }
}
