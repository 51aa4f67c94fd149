// HLS Stream Coordinator: wires the producer, the worker pool and the output
// manager together for one download and enforces fail-fast semantics.

use crate::hls::HlsDownloaderError;
use crate::hls::config::{HlsConfig, PartialOutputPolicy};
use crate::hls::decryption::DecryptionOffloader;
use crate::hls::events::{DownloadEvent, OnProgress};
use crate::hls::fetcher::SegmentDownloader;
use crate::hls::key_cache::KeyCache;
use crate::hls::output::{OutputManager, OutputStats};
use crate::hls::playlist::PlaylistPlan;
use crate::hls::processor::SegmentProcessor;
use crate::hls::scheduler::{SegmentTask, WorkerPool};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncWrite, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a successful download.
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    pub segments: usize,
    pub bytes_written: u64,
    pub elapsed: Duration,
    pub path: PathBuf,
    /// Largest number of segments held back by the reorder buffer
    pub peak_buffered: usize,
}

/// First terminal failure of a run. Later failures are only logged.
#[derive(Clone, Default)]
struct FirstFailure(Arc<Mutex<Option<HlsDownloaderError>>>);

impl FirstFailure {
    fn record(&self, err: &HlsDownloaderError) -> bool {
        let mut slot = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(err.clone());
        true
    }

    fn take(&self) -> Option<HlsDownloaderError> {
        match self.0.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

fn emit(on_progress: &Option<OnProgress>, event: DownloadEvent) {
    if let Some(on_progress) = on_progress {
        on_progress(event);
    }
}

/// Runs one download. The cancellation token must be the one the downloader
/// observes, so that cancelling it aborts in-flight requests; a coordinator
/// whose token has fired cannot be reused.
pub struct HlsStreamCoordinator {
    config: Arc<HlsConfig>,
    downloader: Arc<dyn SegmentDownloader>,
    token: CancellationToken,
}

impl HlsStreamCoordinator {
    pub fn new(
        config: Arc<HlsConfig>,
        downloader: Arc<dyn SegmentDownloader>,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            downloader,
            token,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Downloads every segment of `plan` into `output_path`, in playlist order.
    ///
    /// On failure the output is closed unfinished and then deleted or kept
    /// according to the configured [`PartialOutputPolicy`].
    pub async fn run_download(
        &self,
        plan: &PlaylistPlan,
        output_path: &Path,
        on_progress: Option<OnProgress>,
    ) -> Result<DownloadSummary, HlsDownloaderError> {
        let started = Instant::now();
        info!(
            segments = plan.len(),
            workers = self.config.scheduler_config.worker_count,
            path = %output_path.display(),
            "Starting download"
        );

        match self.download_to_file(plan, output_path, on_progress).await {
            Ok(stats) => {
                let summary = DownloadSummary {
                    segments: stats.segments_written,
                    bytes_written: stats.bytes_written,
                    elapsed: started.elapsed(),
                    path: output_path.to_path_buf(),
                    peak_buffered: stats.peak_buffered,
                };
                info!(
                    segments = summary.segments,
                    bytes = summary.bytes_written,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "Download finished"
                );
                Ok(summary)
            }
            Err(e) => {
                self.handle_partial_output(output_path).await;
                Err(e)
            }
        }
    }

    async fn download_to_file(
        &self,
        plan: &PlaylistPlan,
        output_path: &Path,
        on_progress: Option<OnProgress>,
    ) -> Result<OutputStats, HlsDownloaderError> {
        let file = File::create(output_path).await?;
        let writer = BufWriter::with_capacity(self.config.output_config.write_buffer_size, file);

        let (writer, stats) = self.run_to_writer(plan, writer, on_progress).await?;
        let file = writer.into_inner();
        file.sync_all().await?;
        Ok(stats)
    }

    async fn handle_partial_output(&self, output_path: &Path) {
        match self.config.output_config.partial_output_policy {
            PartialOutputPolicy::Delete => match tokio::fs::remove_file(output_path).await {
                Ok(()) => debug!(path = %output_path.display(), "Removed partial output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %output_path.display(), error = %e, "Failed to remove partial output")
                }
            },
            PartialOutputPolicy::Keep => {
                warn!(path = %output_path.display(), "Keeping partial output after failure")
            }
        }
    }

    /// Runs the pipeline into an arbitrary sink and returns it flushed.
    pub async fn run_to_writer<W>(
        &self,
        plan: &PlaylistPlan,
        writer: W,
        on_progress: Option<OnProgress>,
    ) -> Result<(W, OutputStats), HlsDownloaderError>
    where
        W: AsyncWrite + Unpin,
    {
        let total = plan.len();
        emit(&on_progress, DownloadEvent::Started { total });

        if self.token.is_cancelled() {
            return Err(HlsDownloaderError::Cancelled);
        }

        let scheduler_config = &self.config.scheduler_config;
        let pool = Arc::new(WorkerPool::new(
            scheduler_config.worker_count,
            scheduler_config.queue_capacity,
            self.token.clone(),
        ));
        let key_cache = Arc::new(KeyCache::new(Arc::clone(&self.downloader)));
        let processor = Arc::new(SegmentProcessor::new(
            Arc::clone(&self.downloader),
            key_cache,
            DecryptionOffloader::new(self.config.decryption_config.offload_decryption_to_cpu_pool),
        ));
        let (result_tx, result_rx) = mpsc::channel(pool.worker_count() * 2);
        let first_failure = FirstFailure::default();

        let default_key = plan.default_key.clone().map(Arc::new);
        let tasks: Vec<SegmentTask> = plan
            .segments
            .iter()
            .enumerate()
            .map(|(position, descriptor)| SegmentTask {
                index: position,
                descriptor: descriptor.clone(),
                default_key: default_key.clone(),
            })
            .collect();

        let producer = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                for task in tasks {
                    if let Err(e) = pool.enqueue(task).await {
                        debug!(error = %e, "Producer stopped early");
                        break;
                    }
                }
                pool.close_queue();
            })
        };

        let workers = {
            let pool = Arc::clone(&pool);
            let token = self.token.clone();
            let on_progress = on_progress.clone();
            let first_failure = first_failure.clone();
            tokio::spawn(async move {
                pool.run(move |task: SegmentTask| {
                    let processor = Arc::clone(&processor);
                    let result_tx = result_tx.clone();
                    let token = token.clone();
                    let on_progress = on_progress.clone();
                    let first_failure = first_failure.clone();
                    async move {
                        let result = processor.process(&task).await;
                        match &result {
                            Ok(segment) => emit(
                                &on_progress,
                                DownloadEvent::SegmentCompleted {
                                    index: segment.index,
                                    uri: segment.uri.clone(),
                                    bytes: segment.data.len(),
                                },
                            ),
                            Err(e) if e.is_cancelled() => return,
                            Err(e) => {
                                emit(
                                    &on_progress,
                                    DownloadEvent::SegmentFailed {
                                        index: task.index,
                                        uri: task.uri().to_string(),
                                        error: e.to_string(),
                                    },
                                );
                                if first_failure.record(e) {
                                    error!(index = task.index, uri = %task.uri(), error = %e, "Segment failed, cancelling download");
                                    token.cancel();
                                } else {
                                    debug!(index = task.index, error = %e, "Segment failed after cancellation");
                                }
                            }
                        }
                        let _ = result_tx.send(result).await;
                    }
                })
                .await
            })
        };

        let outcome = OutputManager::new(writer, total)
            .with_progress(on_progress.clone())
            .run(result_rx)
            .await;

        let cancelled_externally = outcome.is_err() && self.token.is_cancelled();
        if outcome.is_err() {
            self.token.cancel();
        }

        if let Err(e) = producer.await {
            error!(error = %e, "Producer task failed");
        }
        let pool_result = match workers.await {
            Ok(result) => result,
            Err(e) => Err(HlsDownloaderError::InternalError(format!(
                "worker pool task failed: {e}"
            ))),
        };

        match outcome {
            Ok((writer, stats)) => {
                pool_result?;
                emit(
                    &on_progress,
                    DownloadEvent::Finished {
                        segments: stats.segments_written,
                        bytes: stats.bytes_written,
                    },
                );
                Ok((writer, stats))
            }
            Err(output_error) => {
                if let Some(first) = first_failure.take() {
                    return Err(first);
                }
                if cancelled_externally {
                    return Err(HlsDownloaderError::Cancelled);
                }
                Err(output_error)
            }
        }
    }
}
