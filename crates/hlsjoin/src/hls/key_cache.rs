// HLS Key Cache: decryption keys fetched at most once per URI.

use crate::hls::HlsDownloaderError;
use crate::hls::fetcher::{ResourceKind, SegmentDownloader};
use bytes::Bytes;
use moka::future::Cache;
use std::sync::Arc;
use tracing::debug;

pub struct KeyCache {
    downloader: Arc<dyn SegmentDownloader>,
    keys: Cache<String, Bytes>,
}

impl KeyCache {
    pub fn new(downloader: Arc<dyn SegmentDownloader>) -> Self {
        Self {
            downloader,
            // Unbounded: a key stays cached for the cache's lifetime, however
            // often the playlist rotates keys
            keys: Cache::builder().build(),
        }
    }

    /// Returns the key bytes for `uri`, fetching them on first use.
    ///
    /// Concurrent first requests for the same URI share one fetch. A failed
    /// fetch is not remembered, so a later call tries again.
    pub async fn get_key(&self, uri: &str) -> Result<Bytes, HlsDownloaderError> {
        let downloader = Arc::clone(&self.downloader);
        let owned_uri = uri.to_string();
        self.keys
            .try_get_with(owned_uri.clone(), async move {
                debug!(uri = %owned_uri, "Fetching decryption key");
                downloader.fetch(&owned_uri, ResourceKind::Key, None).await
            })
            .await
            .map_err(|e: Arc<HlsDownloaderError>| match e.as_ref() {
                HlsDownloaderError::Cancelled => HlsDownloaderError::Cancelled,
                HlsDownloaderError::KeyError { .. } => e.as_ref().clone(),
                other => HlsDownloaderError::KeyError {
                    uri: uri.to_string(),
                    reason: other.to_string(),
                },
            })
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.keys.contains_key(uri)
    }
}
