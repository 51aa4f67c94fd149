use std::sync::Arc;

#[derive(Debug, thiserror::Error, Clone)]
pub enum HlsDownloaderError {
    /// Network failure or timeout after the retry budget was spent.
    #[error("Network error fetching {uri} after {attempts} attempt(s): {source}")]
    TransportError {
        uri: String,
        attempts: u32,
        #[source]
        source: Arc<reqwest::Error>,
    },
    /// Non-2xx status or empty body after the retry budget was spent.
    #[error("Request to {uri} failed after {attempts} attempt(s): {reason}")]
    ProtocolError {
        uri: String,
        attempts: u32,
        reason: String,
    },
    #[error("Failed to resolve key {uri}: {reason}")]
    KeyError { uri: String, reason: String },
    #[error("Decryption error: {0}")]
    DecryptionError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Playlist error: {0}")]
    PlaylistError(String),
    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: Arc<std::io::Error>,
    },
    #[error("Segment {index} ({uri}) failed: {source}")]
    SegmentFailed {
        index: usize,
        uri: String,
        #[source]
        source: Box<HlsDownloaderError>,
    },
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl HlsDownloaderError {
    /// Tags an error with the segment it belongs to. Already tagged errors are left alone.
    pub fn for_segment(self, index: usize, uri: &str) -> Self {
        match self {
            err @ HlsDownloaderError::SegmentFailed { .. } => err,
            HlsDownloaderError::Cancelled => HlsDownloaderError::Cancelled,
            other => HlsDownloaderError::SegmentFailed {
                index,
                uri: uri.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping segment tagging.
    pub fn root_cause(&self) -> &HlsDownloaderError {
        match self {
            HlsDownloaderError::SegmentFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), HlsDownloaderError::Cancelled)
    }
}

// Manual implementation of From<std::io::Error> for HlsDownloaderError
// because of the Arc wrapping.
impl From<std::io::Error> for HlsDownloaderError {
    fn from(err: std::io::Error) -> Self {
        HlsDownloaderError::IoError {
            source: Arc::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_segment_wraps_once() {
        let err = HlsDownloaderError::DecryptionError("bad padding".to_string())
            .for_segment(3, "http://host/seg3.ts")
            .for_segment(9, "http://host/other.ts");

        match &err {
            HlsDownloaderError::SegmentFailed { index, uri, .. } => {
                assert_eq!(*index, 3);
                assert_eq!(uri, "http://host/seg3.ts");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            err.root_cause(),
            HlsDownloaderError::DecryptionError(_)
        ));
        assert_eq!(
            err.to_string(),
            "Segment 3 (http://host/seg3.ts) failed: Decryption error: bad padding"
        );
    }

    #[test]
    fn test_cancelled_is_not_tagged() {
        let err = HlsDownloaderError::Cancelled.for_segment(1, "http://host/seg1.ts");
        assert!(err.is_cancelled());
        assert!(matches!(err, HlsDownloaderError::Cancelled));
    }
}
