//! Channel reader: fetch then decode, with failures classified for requeue.

use std::time::Instant;

use chanop_core::{Channel, DecodedResource};
use metrics::{counter, histogram};
use tracing::{info, warn};

use crate::{decode_dir, ChannelError, DecodeLimits, FetchConfig, Fetcher};

/// Turns a channel descriptor into decoded resources.
///
/// `Ok(vec![])` means the bundle was valid but empty. On `Err`, callers must
/// consult [`ChannelError::requeue`] rather than treating every error alike.
#[async_trait::async_trait]
pub trait ChannelReader: Send + Sync {
    async fn read(&self, channel: &Channel) -> Result<Vec<DecodedResource>, ChannelError>;
}

/// Reads bundles over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpChannelReader {
    fetcher: Fetcher,
    limits: DecodeLimits,
}

impl HttpChannelReader {
    pub fn new(client: reqwest::Client, config: FetchConfig, limits: DecodeLimits) -> Self {
        Self { fetcher: Fetcher::new(client, config), limits }
    }
}

#[async_trait::async_trait]
impl ChannelReader for HttpChannelReader {
    async fn read(&self, channel: &Channel) -> Result<Vec<DecodedResource>, ChannelError> {
        let t0 = Instant::now();
        counter!("channel_fetch_total", 1u64);
        let res = async {
            let staged = self.fetcher.fetch(channel).await?;
            let root = staged.root().to_path_buf();
            let limits = self.limits;
            let decoded = tokio::task::spawn_blocking(move || decode_dir(&root, &limits)).await;
            // `staged` lives until here so the tree outlives the walk.
            drop(staged);
            match decoded {
                Ok(r) => r.map_err(|source| ChannelError::Decode { channel: channel.name.clone(), source }),
                Err(join) => Err(ChannelError::Decode {
                    channel: channel.name.clone(),
                    source: crate::DecodeError::Io { path: Default::default(), source: std::io::Error::new(std::io::ErrorKind::Other, join) },
                }),
            }
        }
        .await;
        histogram!("channel_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(objs) => {
                counter!("manifests_decoded_total", objs.len() as u64);
                info!(channel = %channel.name, version = %channel.version, count = objs.len(), "manifests decoded");
            }
            Err(e) => {
                counter!("channel_fetch_err", 1u64);
                warn!(channel = %channel.name, version = %channel.version, requeue = e.requeue(), error = %e, "channel read failed");
            }
        }
        res
    }
}
