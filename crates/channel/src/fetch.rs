//! Archive fetcher: HTTP GET into private staging, then gzip/tar unpack.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use chanop_core::Channel;
use flate2::read::GzDecoder;
use tar::Archive;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::FetchConfig;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetching manifests for {channel}: {source}")]
    Transport {
        channel: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("error response status code {status} for {channel}")]
    Status { channel: String, status: u16 },
    #[error("bundle for {channel} exceeds {limit} bytes")]
    TooLarge { channel: String, limit: u64 },
    #[error("bundle for {channel} unpacks to more than {limit} bytes")]
    UnpackedTooLarge { channel: String, limit: u64 },
    #[error("empty response body for {channel}")]
    EmptyBody { channel: String },
    #[error("copying manifest contents for {channel}: {source}")]
    Download {
        channel: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("staging manifests for {channel}: {source}")]
    Staging {
        channel: String,
        #[source]
        source: io::Error,
    },
    #[error("unarchiving manifests for {channel}: {source}")]
    Unarchive {
        channel: String,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// Staging, download-copy and unpack failures are transient; transport and status failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::EmptyBody { .. } | FetchError::Download { .. } | FetchError::Staging { .. } | FetchError::Unarchive { .. }
        )
    }
}

/// An unpacked bundle. Dropping it removes the archive and the unpacked tree.
#[derive(Debug)]
pub struct StagedBundle {
    dir: TempDir,
    root: PathBuf,
}

impl StagedBundle {
    /// Root of the unpacked tree.
    pub fn root(&self) -> &Path { &self.root }
    /// Private staging directory holding both the archive and the tree.
    pub fn staging(&self) -> &Path { self.dir.path() }
}

/// Downloads channel bundles with a caller-supplied HTTP client.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, config: FetchConfig) -> Self {
        Self { client, config }
    }

    pub async fn fetch(&self, channel: &Channel) -> Result<StagedBundle, FetchError> {
        let name = channel.name.clone();
        info!(channel = %channel.name, version = %channel.version, url = %channel.url, "fetching manifests");
        let mut resp = self
            .client
            .get(&channel.url)
            .send()
            .await
            .map_err(|source| FetchError::Transport { channel: name.clone(), source })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status { channel: name, status: status.as_u16() });
        }
        let limit = self.config.max_archive_bytes;
        if resp.content_length().is_some_and(|len| len > limit) {
            return Err(FetchError::TooLarge { channel: name, limit });
        }

        let staging = |source| FetchError::Staging { channel: name.clone(), source };
        let mut builder = tempfile::Builder::new();
        builder.prefix("chanop-");
        let dir = match &self.config.staging_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(staging)?;

        let base = staging_name(channel);
        let archive = dir.path().join(format!("{}.tar.gz", base));
        let mut out = tokio::fs::File::create(&archive).await.map_err(staging)?;
        let mut written: u64 = 0;
        loop {
            let chunk = resp
                .chunk()
                .await
                .map_err(|source| FetchError::Download { channel: name.clone(), source })?;
            let Some(chunk) = chunk else { break };
            written = written.saturating_add(chunk.len() as u64);
            if written > limit {
                return Err(FetchError::TooLarge { channel: name.clone(), limit });
            }
            out.write_all(&chunk).await.map_err(staging)?;
        }
        out.flush().await.map_err(staging)?;
        drop(out);
        if written == 0 {
            return Err(FetchError::EmptyBody { channel: name });
        }
        debug!(bytes = written, path = %archive.display(), "bundle staged");

        let root = dir.path().join(&base);
        let target = root.clone();
        let budget = self.config.max_unpacked_bytes;
        let unpacked = tokio::task::spawn_blocking(move || unpack(&archive, &target, budget))
            .await
            .unwrap_or_else(|e| Err(UnpackError::Io(io::Error::new(io::ErrorKind::Other, e))));
        match unpacked {
            Ok(()) => {}
            Err(UnpackError::OverBudget) => return Err(FetchError::UnpackedTooLarge { channel: name, limit: budget }),
            Err(UnpackError::Io(source)) => return Err(FetchError::Unarchive { channel: name, source }),
        }
        Ok(StagedBundle { dir, root })
    }
}

/// `<name>-<version>` with path separators replaced.
fn staging_name(channel: &Channel) -> String {
    channel
        .base_name()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '-' } else { c })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let mut f = File::open(path)?;
    let n = f.read(&mut magic)?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}

#[derive(Debug, thiserror::Error)]
enum UnpackError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unpacked size over budget")]
    OverBudget,
}

/// Unpack a tar archive, gzipped or plain, into `dest`. Entry sizes are summed
/// from the headers before any data is written, so an over-budget entry is never
/// expanded.
fn unpack(archive: &Path, dest: &Path, budget: u64) -> Result<(), UnpackError> {
    std::fs::create_dir_all(dest)?;
    let reader = BufReader::new(File::open(archive)?);
    if is_gzip(archive)? {
        unpack_entries(Archive::new(GzDecoder::new(reader)), dest, budget)
    } else {
        unpack_entries(Archive::new(reader), dest, budget)
    }
}

fn unpack_entries<R: Read>(mut ar: Archive<R>, dest: &Path, budget: u64) -> Result<(), UnpackError> {
    let mut total: u64 = 0;
    for entry in ar.entries()? {
        let mut entry = entry?;
        total = total.saturating_add(entry.size());
        if total > budget {
            return Err(UnpackError::OverBudget);
        }
        entry.unpack_in(dest)?;
    }
    Ok(())
}
