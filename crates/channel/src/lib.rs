//! chanop channel reader: turns a channel descriptor into decoded resources.
//!
//! `fetch` downloads and unpacks a bundle into private staging, `decode` walks
//! the unpacked tree, and `reader` composes both behind [`ChannelReader`].

#![forbid(unsafe_code)]

pub mod decode;
pub mod fetch;
pub mod reader;

use std::path::PathBuf;
use std::time::Duration;

pub use decode::{decode_dir, DecodeError, DecodeLimits};
pub use fetch::{FetchError, Fetcher, StagedBundle};
pub use reader::{ChannelReader, HttpChannelReader};

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default)
}

/// Transport and staging settings for the fetcher.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Skip TLS certificate verification for channel URLs.
    pub insecure_skip_verify: bool,
    /// Whole-request timeout; `None` leaves it to the client.
    pub timeout: Option<Duration>,
    /// Parent directory for staging; system temp dir when `None`.
    pub staging_dir: Option<PathBuf>,
    pub max_archive_bytes: u64,
    /// Budget for the sum of entry sizes once unpacked.
    pub max_unpacked_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            timeout: Some(Duration::from_secs(60)),
            staging_dir: None,
            max_archive_bytes: 64 * 1024 * 1024,
            max_unpacked_bytes: 256 * 1024 * 1024,
        }
    }
}

impl FetchConfig {
    /// Defaults overridden by `CHANOP_MAX_ARCHIVE_BYTES` / `CHANOP_MAX_UNPACKED_BYTES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_archive_bytes: env_u64("CHANOP_MAX_ARCHIVE_BYTES", d.max_archive_bytes),
            max_unpacked_bytes: env_u64("CHANOP_MAX_UNPACKED_BYTES", d.max_unpacked_bytes),
            ..d
        }
    }

    /// Build an HTTP client honouring the TLS and timeout policy.
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        let mut b = reqwest::Client::builder()
            .user_agent(concat!("chanop/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(self.insecure_skip_verify);
        if let Some(t) = self.timeout {
            b = b.timeout(t);
        }
        b.build()
    }
}

/// Failure of one channel read, split by whether a later retry can help.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("walking manifests for {channel}: {source}")]
    Decode {
        channel: String,
        #[source]
        source: DecodeError,
    },
}

impl ChannelError {
    /// True when the failure is likely transient and the caller should requeue.
    pub fn requeue(&self) -> bool {
        match self {
            ChannelError::Fetch(e) => e.is_retryable(),
            ChannelError::Decode { .. } => false,
        }
    }
}
