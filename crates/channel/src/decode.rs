//! Manifest decoder: one resource per regular file, lexical traversal order.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chanop_core::{DecodedResource, ManifestError};
use serde_json::Value as Json;
use walkdir::WalkDir;

/// Size and complexity guards applied to every manifest.
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    pub max_manifest_bytes: u64,
    pub max_nodes: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self { max_manifest_bytes: 1_000_000, max_nodes: 100_000 }
    }
}

impl DecodeLimits {
    /// Defaults overridden by `CHANOP_MAX_MANIFEST_BYTES` / `CHANOP_MAX_MANIFEST_NODES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_manifest_bytes: crate::env_u64("CHANOP_MAX_MANIFEST_BYTES", d.max_manifest_bytes),
            max_nodes: std::env::var("CHANOP_MAX_MANIFEST_NODES").ok().and_then(|s| s.parse().ok()).unwrap_or(d.max_nodes),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} exceeds {limit} bytes")]
    TooLarge { path: PathBuf, limit: u64 },
    #[error("{path} is too complex (>{limit} nodes)")]
    TooComplex { path: PathBuf, limit: usize },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("converting {path}: {source}")]
    Convert {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    let mut pending = vec![v];
    let mut seen = 0usize;
    while let Some(node) = pending.pop() {
        seen += 1;
        if seen >= max {
            return true;
        }
        match node {
            Json::Object(map) => pending.extend(map.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    false
}

/// Decode one manifest document. `rel` is only used in error messages.
pub fn decode_bytes(bytes: &[u8], rel: &Path, limits: &DecodeLimits) -> Result<DecodedResource, DecodeError> {
    let path = || rel.to_path_buf();
    if bytes.len() as u64 > limits.max_manifest_bytes {
        return Err(DecodeError::TooLarge { path: path(), limit: limits.max_manifest_bytes });
    }
    let yaml: serde_yaml::Value = serde_yaml::from_slice(bytes).map_err(|source| DecodeError::Parse { path: path(), source })?;
    let json = serde_json::to_value(yaml).map_err(|source| DecodeError::Convert { path: path(), source })?;
    if node_budget_exceeded(&json, limits.max_nodes) {
        return Err(DecodeError::TooComplex { path: path(), limit: limits.max_nodes });
    }
    DecodedResource::from_json(json).map_err(|source| DecodeError::Manifest { path: path(), source })
}

/// Read at most `cap + 1` bytes: enough for `decode_bytes` to see the file is over
/// the limit without pulling the rest into memory.
fn read_capped(path: &Path, cap: u64) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    File::open(path)?.take(cap.saturating_add(1)).read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Decode every regular file under `root`. The first failure aborts the walk and
/// discards everything decoded so far. An empty tree yields an empty vec.
pub fn decode_dir(root: &Path, limits: &DecodeLimits) -> Result<Vec<DecodedResource>, DecodeError> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| DecodeError::Io {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let bytes = read_capped(entry.path(), limits.max_manifest_bytes).map_err(|source| DecodeError::Io { path: rel.to_path_buf(), source })?;
        out.push(decode_bytes(&bytes, rel, limits)?);
    }
    Ok(out)
}
