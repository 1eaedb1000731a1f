//! chanop core types: the ChannelSet resource, channel descriptors and decoded manifests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    core::{DynamicObject, GroupVersionKind},
    CustomResource, Resource, ResourceExt,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Application-identity label; carries the channel name.
pub const APP_LABEL: &str = "app";
/// Channel-specific label; carries the (sanitized) channel version.
pub const CHANNEL_VERSION_LABEL: &str = "chanop.dev/channel-version";
/// Field manager / user agent used for cluster writes.
pub const FIELD_MANAGER: &str = "chanop";

/// One remote manifest bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub name: String,
    pub url: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl Channel {
    /// `<name>-<version>`; used for staging file names.
    pub fn base_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// Desired set of channels. Everything created from these channels is owned by the ChannelSet.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "chanop.dev",
    version = "v1alpha1",
    kind = "ChannelSet",
    plural = "channelsets",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSetSpec {
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OwnerError {
    #[error("owner is missing metadata.{0}")]
    MissingIdentity(&'static str),
    #[error("{kind} {name} is already controlled by {owner_kind} {owner_name}")]
    AlreadyControlled { kind: String, name: String, owner_kind: String, owner_name: String },
}

impl ChannelSet {
    /// Controller owner reference pointing at this ChannelSet.
    pub fn owner_reference(&self) -> Result<OwnerReference, OwnerError> {
        if self.metadata.name.as_deref().map_or(true, str::is_empty) {
            return Err(OwnerError::MissingIdentity("name"));
        }
        if self.metadata.uid.as_deref().map_or(true, str::is_empty) {
            return Err(OwnerError::MissingIdentity("uid"));
        }
        self.controller_owner_ref(&()).ok_or(OwnerError::MissingIdentity("name"))
    }

    pub fn key(&self) -> Option<SpecKey> {
        Some(SpecKey { namespace: self.metadata.namespace.clone()?, name: self.metadata.name.clone()? })
    }
}

/// Reconciliation key: namespace + name of a ChannelSet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpecKey {
    pub namespace: String,
    pub name: String,
}

impl SpecKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for SpecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `v1/Kind` for the core group, `group/version/Kind` otherwise.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest missing {0}")]
    Missing(&'static str),
    #[error("manifest is not an object")]
    NotAnObject,
    #[error("decoding manifest: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A manifest decoded into a typed, kind-agnostic object.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedResource {
    gvk: GroupVersionKind,
    obj: DynamicObject,
}

impl DecodedResource {
    /// Decode a JSON document. apiVersion, kind and metadata.name are required.
    pub fn from_json(json: serde_json::Value) -> Result<Self, ManifestError> {
        if !json.is_object() {
            return Err(ManifestError::NotAnObject);
        }
        let api_version = json.get("apiVersion").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).ok_or(ManifestError::Missing("apiVersion"))?;
        let kind = json.get("kind").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).ok_or(ManifestError::Missing("kind"))?;
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        let gvk = GroupVersionKind { group, version, kind: kind.to_string() };
        json.get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(ManifestError::Missing("metadata.name"))?;
        let obj: DynamicObject = serde_json::from_value(json)?;
        Ok(Self { gvk, obj })
    }

    pub fn gvk(&self) -> &GroupVersionKind { &self.gvk }
    pub fn kind(&self) -> &str { &self.gvk.kind }
    pub fn name(&self) -> String { self.obj.name_any() }
    pub fn namespace(&self) -> Option<String> { self.obj.namespace() }
    pub fn set_namespace(&mut self, ns: Option<String>) { self.obj.metadata.namespace = ns; }
    pub fn labels(&self) -> &BTreeMap<String, String> { self.obj.labels() }

    /// Merge `extra` into the existing labels; keys in `extra` win.
    pub fn set_labels(&mut self, extra: BTreeMap<String, String>) {
        self.obj.labels_mut().extend(extra);
    }

    /// Stamp `owner` as the controlling owner. A reference with the same uid is replaced;
    /// a different controller is an error.
    pub fn set_owner(&mut self, owner: OwnerReference) -> Result<(), OwnerError> {
        let kind = self.gvk.kind.clone();
        let name = self.name();
        let refs = self.obj.owner_references_mut();
        if let Some(other) = refs.iter().find(|r| r.uid != owner.uid && r.controller == Some(true)) {
            return Err(OwnerError::AlreadyControlled { kind, name, owner_kind: other.kind.clone(), owner_name: other.name.clone() });
        }
        refs.retain(|r| r.uid != owner.uid);
        refs.push(owner);
        Ok(())
    }

    pub fn object(&self) -> &DynamicObject { &self.obj }
    pub fn into_object(self) -> DynamicObject { self.obj }
}

static INVALID_LABEL_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("static regex"));

/// Coerce an arbitrary string into a valid label value. May return an empty string.
pub fn sanitize_label_value(raw: &str) -> String {
    let replaced = INVALID_LABEL_CHARS.replace_all(raw, "-");
    let truncated: String = replaced.chars().take(63).collect();
    truncated.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

/// Labels stamped on every resource created from `channel`.
pub fn channel_labels(channel: &Channel) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(APP_LABEL.to_string(), channel.name.clone());
    let version = sanitize_label_value(&channel.version);
    if !version.is_empty() {
        out.insert(CHANNEL_VERSION_LABEL.to_string(), version);
    }
    out
}
