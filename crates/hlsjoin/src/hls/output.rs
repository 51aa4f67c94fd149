// HLS Output Manager: restores playlist order before segments reach the sink.
// Segments finishing early wait in a reorder buffer until every earlier one
// has been written.

use crate::hls::HlsDownloaderError;
use crate::hls::events::{DownloadEvent, OnProgress};
use crate::hls::processor::ProcessedSegment;
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub segments_written: usize,
    pub bytes_written: u64,
    /// Largest number of segments held back at once
    pub peak_buffered: usize,
}

pub struct OutputManager<W> {
    writer: W,
    total: usize,
    next_index: usize,
    reorder_buffer: BTreeMap<usize, Bytes>,
    stats: OutputStats,
    on_progress: Option<OnProgress>,
}

impl<W: AsyncWrite + Unpin> OutputManager<W> {
    /// Expects exactly `total` segments, indexed `0..total`.
    pub fn new(writer: W, total: usize) -> Self {
        Self {
            writer,
            total,
            next_index: 0,
            reorder_buffer: BTreeMap::new(),
            stats: OutputStats::default(),
            on_progress: None,
        }
    }

    pub fn with_progress(mut self, on_progress: Option<OnProgress>) -> Self {
        self.on_progress = on_progress;
        self
    }

    /// Index of the next segment to be written.
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn buffered(&self) -> usize {
        self.reorder_buffer.len()
    }

    pub fn is_complete(&self) -> bool {
        self.next_index >= self.total
    }

    pub fn stats(&self) -> &OutputStats {
        &self.stats
    }

    /// Accepts one segment in any order.
    ///
    /// The expected segment is written immediately together with any
    /// contiguous run already buffered behind it; later ones are held back.
    /// Indices already written or buffered are ignored, so nothing is ever
    /// written twice.
    pub async fn join(&mut self, index: usize, data: Bytes) -> Result<(), HlsDownloaderError> {
        if index >= self.total {
            return Err(HlsDownloaderError::InternalError(format!(
                "segment index {index} out of range (total {})",
                self.total
            )));
        }
        if index < self.next_index || self.reorder_buffer.contains_key(&index) {
            warn!(index, next = self.next_index, "Ignoring duplicate segment");
            return Ok(());
        }

        if index != self.next_index {
            trace!(index, next = self.next_index, "Buffering out-of-order segment");
            self.reorder_buffer.insert(index, data);
            self.stats.peak_buffered = self.stats.peak_buffered.max(self.reorder_buffer.len());
            return Ok(());
        }

        self.write_segment(index, data).await?;
        while let Some(data) = self.reorder_buffer.remove(&self.next_index) {
            self.write_segment(self.next_index, data).await?;
        }
        Ok(())
    }

    async fn write_segment(&mut self, index: usize, data: Bytes) -> Result<(), HlsDownloaderError> {
        self.writer.write_all(&data).await?;
        self.next_index += 1;
        self.stats.segments_written += 1;
        self.stats.bytes_written += data.len() as u64;
        trace!(index, bytes = data.len(), "Wrote segment");
        if let Some(on_progress) = &self.on_progress {
            on_progress(DownloadEvent::SegmentWritten {
                index,
                bytes: data.len(),
            });
        }
        Ok(())
    }

    /// Consumes worker results until every segment has been written, then
    /// flushes the sink and hands it back.
    ///
    /// The first error from the channel ends the run with that error. A channel
    /// that closes before all segments arrived is an internal error.
    pub async fn run(
        mut self,
        mut input_rx: mpsc::Receiver<Result<ProcessedSegment, HlsDownloaderError>>,
    ) -> Result<(W, OutputStats), HlsDownloaderError> {
        while !self.is_complete() {
            match input_rx.recv().await {
                Some(Ok(segment)) => self.join(segment.index, segment.data).await?,
                Some(Err(e)) => {
                    debug!(error = %e, "Segment error received, stopping output");
                    return Err(e);
                }
                None => {
                    return Err(HlsDownloaderError::InternalError(format!(
                        "incomplete output: {} of {} segments written, {} buffered",
                        self.next_index,
                        self.total,
                        self.reorder_buffer.len()
                    )));
                }
            }
        }

        self.writer.flush().await?;
        debug!(
            segments = self.stats.segments_written,
            bytes = self.stats.bytes_written,
            peak_buffered = self.stats.peak_buffered,
            "Output complete"
        );
        Ok((self.writer, self.stats))
    }
}
