// HLS Segment Fetcher: one HTTP GET per resource, with bounded retries.

use crate::hls::HlsDownloaderError;
use crate::hls::config::HlsConfig;
use crate::hls::playlist::ByteRange;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The kind of resource being fetched; selects timeout and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Playlist,
    Segment,
    Key,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Playlist => write!(f, "playlist"),
            ResourceKind::Segment => write!(f, "segment"),
            ResourceKind::Key => write!(f, "key"),
        }
    }
}

#[async_trait]
pub trait SegmentDownloader: Send + Sync {
    /// Fetches the body of `uri`. Succeeds only with a 2xx status and a non-empty body.
    async fn fetch(
        &self,
        uri: &str,
        kind: ResourceKind,
        byte_range: Option<ByteRange>,
    ) -> Result<Bytes, HlsDownloaderError>;
}

/// Why a single attempt failed.
#[derive(Debug)]
enum AttemptFailure {
    Network(reqwest::Error),
    Status(StatusCode),
    EmptyBody,
}

impl AttemptFailure {
    fn into_error(self, uri: &str, attempts: u32) -> HlsDownloaderError {
        match self {
            AttemptFailure::Network(e) => HlsDownloaderError::TransportError {
                uri: uri.to_string(),
                attempts,
                source: Arc::new(e),
            },
            AttemptFailure::Status(status) => HlsDownloaderError::ProtocolError {
                uri: uri.to_string(),
                attempts,
                reason: format!("http code: {}", status.as_u16()),
            },
            AttemptFailure::EmptyBody => HlsDownloaderError::ProtocolError {
                uri: uri.to_string(),
                attempts,
                reason: "empty response body".to_string(),
            },
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Network(e) => write!(f, "network error: {e}"),
            AttemptFailure::Status(status) => write!(f, "http code: {}", status.as_u16()),
            AttemptFailure::EmptyBody => write!(f, "empty response body"),
        }
    }
}

pub struct SegmentFetcher {
    http_client: Client,
    config: Arc<HlsConfig>,
    token: CancellationToken,
}

impl SegmentFetcher {
    pub fn new(http_client: Client, config: Arc<HlsConfig>, token: CancellationToken) -> Self {
        Self {
            http_client,
            config,
            token,
        }
    }

    fn budget(&self, kind: ResourceKind) -> (Duration, u32) {
        let fetcher_config = &self.config.fetcher_config;
        match kind {
            ResourceKind::Key => (
                fetcher_config.key_download_timeout,
                fetcher_config.max_key_retries,
            ),
            ResourceKind::Playlist | ResourceKind::Segment => (
                fetcher_config.segment_download_timeout,
                fetcher_config.max_segment_retries,
            ),
        }
    }

    async fn attempt(
        &self,
        uri: &str,
        timeout: Duration,
        byte_range: Option<ByteRange>,
    ) -> Result<Bytes, AttemptFailure> {
        let mut request_builder = self.http_client.get(uri);
        if !timeout.is_zero() {
            request_builder = request_builder.timeout(timeout);
        }
        if let Some(range) = byte_range {
            request_builder = request_builder.header(reqwest::header::RANGE, range.header_value());
        }

        let response = request_builder
            .send()
            .await
            .map_err(AttemptFailure::Network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptFailure::Status(status));
        }

        let body = response.bytes().await.map_err(AttemptFailure::Network)?;
        if body.is_empty() {
            return Err(AttemptFailure::EmptyBody);
        }
        Ok(body)
    }
}

#[async_trait]
impl SegmentDownloader for SegmentFetcher {
    /// Retries transport failures, non-2xx statuses and empty bodies until the
    /// budget for `kind` is spent. The last failure decides the error variant.
    async fn fetch(
        &self,
        uri: &str,
        kind: ResourceKind,
        byte_range: Option<ByteRange>,
    ) -> Result<Bytes, HlsDownloaderError> {
        let (timeout, max_retries) = self.budget(kind);
        let mut attempts = 0;
        loop {
            if self.token.is_cancelled() {
                return Err(HlsDownloaderError::Cancelled);
            }
            attempts += 1;

            let outcome = tokio::select! {
                _ = self.token.cancelled() => {
                    return Err(HlsDownloaderError::Cancelled);
                }
                outcome = self.attempt(uri, timeout, byte_range) => outcome,
            };

            let failure = match outcome {
                Ok(body) => {
                    debug!(%uri, %kind, bytes = body.len(), attempts, "Fetched resource");
                    return Ok(body);
                }
                Err(failure) => failure,
            };

            if attempts > max_retries {
                return Err(failure.into_error(uri, attempts));
            }

            warn!(%uri, %kind, attempt = attempts, max_retries, error = %failure, "Fetch failed, retrying");

            let delay = self.config.fetcher_config.retry_delay(attempts);
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.token.cancelled() => {
                        return Err(HlsDownloaderError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
