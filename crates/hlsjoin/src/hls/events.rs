use std::sync::Arc;

/// Progress notifications emitted while a download runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Started {
        total: usize,
    },
    /// A worker produced the plaintext of a segment.
    SegmentCompleted {
        index: usize,
        uri: String,
        bytes: usize,
    },
    SegmentFailed {
        index: usize,
        uri: String,
        error: String,
    },
    /// A segment reached the output file.
    SegmentWritten {
        index: usize,
        bytes: usize,
    },
    Finished {
        segments: usize,
        bytes: u64,
    },
}

/// Progress callback. Invoked from worker tasks, so it must be cheap and thread-safe.
pub type OnProgress = Arc<dyn Fn(DownloadEvent) + Send + Sync>;
