use std::path::Path;
use std::sync::Arc;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{DownloadError, create_client};

use super::coordinator::{DownloadSummary, HlsStreamCoordinator};
use super::events::OnProgress;
use super::fetcher::{SegmentDownloader, SegmentFetcher};
use super::playlist::{PlaylistLoader, PlaylistPlan};
use super::HlsConfig;

/// Entry point for downloading a media playlist into a single file.
pub struct HlsDownloader {
    client: Client,
    config: Arc<HlsConfig>,
    on_progress: Option<OnProgress>,
    cancel: CancellationToken,
}

impl HlsDownloader {
    pub fn new(config: HlsConfig) -> Result<Self, DownloadError> {
        Self::with_config(config)
    }

    /// Create a new HlsDownloader with custom configuration
    pub fn with_config(config: HlsConfig) -> Result<Self, DownloadError> {
        let config = config.normalized();
        let client = create_client(&config.base)?;
        Ok(Self::with_client(client, config))
    }

    /// Use an already configured HTTP client.
    pub fn with_client(client: Client, config: HlsConfig) -> Self {
        Self {
            client,
            config: Arc::new(config.normalized()),
            on_progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, on_progress: OnProgress) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn config(&self) -> &HlsConfig {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Cancelling this token aborts every download started by this downloader.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn fetcher(&self, token: CancellationToken) -> Arc<dyn SegmentDownloader> {
        Arc::new(SegmentFetcher::new(
            self.client.clone(),
            Arc::clone(&self.config),
            token,
        ))
    }

    /// Fetches and parses a remote media playlist.
    pub async fn load_url(&self, url: &str) -> Result<PlaylistPlan, DownloadError> {
        let loader = PlaylistLoader::new(self.fetcher(self.cancel.child_token()));
        Ok(loader.load_url(url).await?)
    }

    /// Reads a local media playlist. Relative URIs resolve against `base_url`.
    pub async fn load_file(
        &self,
        path: &Path,
        base_url: Option<&str>,
    ) -> Result<PlaylistPlan, DownloadError> {
        let base_url = base_url.map(Url::parse).transpose()?;
        Ok(PlaylistLoader::load_file(path, base_url).await?)
    }

    pub async fn download_url(
        &self,
        url: &str,
        output: &Path,
    ) -> Result<DownloadSummary, DownloadError> {
        let plan = self.load_url(url).await?;
        self.download_plan(&plan, output).await
    }

    pub async fn download_file(
        &self,
        path: &Path,
        output: &Path,
    ) -> Result<DownloadSummary, DownloadError> {
        let plan = self.load_file(path, None).await?;
        self.download_plan(&plan, output).await
    }

    /// Downloads an already built plan. Each call gets its own cancellation
    /// scope, so a failed download does not poison the next one.
    pub async fn download_plan(
        &self,
        plan: &PlaylistPlan,
        output: &Path,
    ) -> Result<DownloadSummary, DownloadError> {
        let token = self.cancel.child_token();
        let coordinator = HlsStreamCoordinator::new(
            Arc::clone(&self.config),
            self.fetcher(token.clone()),
            token,
        );
        debug!(segments = plan.len(), output = %output.display(), "Dispatching download");
        Ok(coordinator
            .run_download(plan, output, self.on_progress.clone())
            .await?)
    }
}
