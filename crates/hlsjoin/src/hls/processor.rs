// HLS Segment Processor: fetch, resolve key and IV, decrypt.

use crate::hls::HlsDownloaderError;
use crate::hls::decryption::{DecryptionOffloader, resolve_iv};
use crate::hls::fetcher::{ResourceKind, SegmentDownloader};
use crate::hls::key_cache::KeyCache;
use crate::hls::playlist::KeyRef;
use crate::hls::scheduler::SegmentTask;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace};

/// A segment's plaintext, tagged with its playlist position.
#[derive(Debug, Clone)]
pub struct ProcessedSegment {
    pub index: usize,
    pub uri: String,
    pub data: Bytes,
}

pub struct SegmentProcessor {
    downloader: Arc<dyn SegmentDownloader>,
    key_cache: Arc<KeyCache>,
    offloader: DecryptionOffloader,
}

impl SegmentProcessor {
    pub fn new(
        downloader: Arc<dyn SegmentDownloader>,
        key_cache: Arc<KeyCache>,
        offloader: DecryptionOffloader,
    ) -> Self {
        Self {
            downloader,
            key_cache,
            offloader,
        }
    }

    /// Produces the plaintext of one segment. Any failure is terminal for the
    /// segment and comes back tagged with its index and URI.
    pub async fn process(&self, task: &SegmentTask) -> Result<ProcessedSegment, HlsDownloaderError> {
        self.process_inner(task)
            .await
            .map(|data| ProcessedSegment {
                index: task.index,
                uri: task.uri().to_string(),
                data,
            })
            .map_err(|e| e.for_segment(task.index, task.uri()))
    }

    async fn process_inner(&self, task: &SegmentTask) -> Result<Bytes, HlsDownloaderError> {
        let descriptor = &task.descriptor;
        let body = self
            .downloader
            .fetch(&descriptor.uri, ResourceKind::Segment, descriptor.byte_range)
            .await?;

        let Some(key) = KeyRef::effective(descriptor.key.as_ref(), task.default_key.as_deref())
        else {
            trace!(index = task.index, "Segment is not encrypted");
            return Ok(body);
        };

        let key_bytes = self.key_cache.get_key(&key.uri).await?;
        let iv = resolve_iv(key, descriptor.iv_sequence)?;
        let plaintext = self.offloader.decrypt(body, key_bytes, iv).await?;
        debug!(
            index = task.index,
            key_uri = %key.uri,
            bytes = plaintext.len(),
            "Decrypted segment"
        );
        Ok(plaintext)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hls::decryption::index_iv;
    use crate::hls::decryption::tests::{TEST_KEY, encrypt};
    use crate::hls::playlist::{ByteRange, SegmentDescriptor};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Serves canned bodies per URI, optionally after a delay. Unknown URIs
    /// answer like a server returning 404 after the retry budget.
    #[derive(Default)]
    pub(crate) struct MockServer {
        pub(crate) bodies: HashMap<String, (Bytes, Duration)>,
    }

    impl MockServer {
        pub(crate) fn with(mut self, uri: &str, body: impl Into<Bytes>) -> Self {
            self.bodies
                .insert(uri.to_string(), (body.into(), Duration::ZERO));
            self
        }

        pub(crate) fn with_delay(mut self, uri: &str, body: impl Into<Bytes>, delay: Duration) -> Self {
            self.bodies.insert(uri.to_string(), (body.into(), delay));
            self
        }
    }

    #[async_trait]
    impl SegmentDownloader for MockServer {
        async fn fetch(
            &self,
            uri: &str,
            _kind: ResourceKind,
            _byte_range: Option<ByteRange>,
        ) -> Result<Bytes, HlsDownloaderError> {
            match self.bodies.get(uri) {
                Some((body, delay)) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(*delay).await;
                    }
                    Ok(body.clone())
                }
                None => Err(HlsDownloaderError::ProtocolError {
                    uri: uri.to_string(),
                    attempts: 1,
                    reason: "http code: 404".to_string(),
                }),
            }
        }
    }

    fn processor_for(server: MockServer) -> SegmentProcessor {
        let downloader: Arc<dyn SegmentDownloader> = Arc::new(server);
        let key_cache = Arc::new(KeyCache::new(Arc::clone(&downloader)));
        SegmentProcessor::new(downloader, key_cache, DecryptionOffloader::new(false))
    }

    #[tokio::test]
    async fn test_plain_segment_passes_through() {
        let processor = processor_for(MockServer::default().with("http://h/s0.ts", "plain bytes"));
        let task = SegmentTask::new(SegmentDescriptor::new(0, "http://h/s0.ts"), None);

        let out = processor.process(&task).await.unwrap();
        assert_eq!(out.index, 0);
        assert_eq!(&out.data[..], b"plain bytes");
    }

    #[tokio::test]
    async fn test_segment_key_with_index_iv() {
        let ciphertext = encrypt(b"segment five", &TEST_KEY, &index_iv(5));
        let processor = processor_for(
            MockServer::default()
                .with("http://h/s5.ts", ciphertext)
                .with("http://h/k", TEST_KEY.to_vec()),
        );
        let descriptor =
            SegmentDescriptor::new(5, "http://h/s5.ts").with_key(KeyRef::new("http://h/k"));
        let task = SegmentTask::new(descriptor, None);

        let out = processor.process(&task).await.unwrap();
        assert_eq!(&out.data[..], b"segment five");
    }

    #[tokio::test]
    async fn test_implicit_iv_follows_media_sequence_not_position() {
        let ciphertext = encrypt(b"first media segment", &TEST_KEY, &index_iv(0));
        let processor = processor_for(
            MockServer::default()
                .with("http://h/seg0.m4s", ciphertext)
                .with("http://h/k", TEST_KEY.to_vec()),
        );
        // Output position 1, behind an init section
        let descriptor = SegmentDescriptor::new(1, "http://h/seg0.m4s")
            .with_key(KeyRef::new("http://h/k"))
            .with_iv_sequence(0);

        let out = processor
            .process(&SegmentTask::new(descriptor, None))
            .await
            .unwrap();
        assert_eq!(out.index, 1);
        assert_eq!(&out.data[..], b"first media segment");
    }

    #[tokio::test]
    async fn test_default_key_with_explicit_iv() {
        let iv: [u8; 16] = [0xAB; 16];
        let ciphertext = encrypt(b"default key segment", &TEST_KEY, &iv);
        let processor = processor_for(
            MockServer::default()
                .with("http://h/s1.ts", ciphertext)
                .with("http://h/default.key", TEST_KEY.to_vec()),
        );
        let default_key = Arc::new(
            KeyRef::new("http://h/default.key").with_iv(format!("0x{}", hex::encode(iv))),
        );
        let task = SegmentTask::new(SegmentDescriptor::new(1, "http://h/s1.ts"), Some(default_key));

        let out = processor.process(&task).await.unwrap();
        assert_eq!(&out.data[..], b"default key segment");
    }

    #[tokio::test]
    async fn test_fetch_failure_is_tagged_with_segment() {
        let processor = processor_for(MockServer::default());
        let task = SegmentTask::new(SegmentDescriptor::new(3, "http://h/missing.ts"), None);

        let err = processor.process(&task).await.unwrap_err();
        match &err {
            HlsDownloaderError::SegmentFailed { index, uri, .. } => {
                assert_eq!(*index, 3);
                assert_eq!(uri, "http://h/missing.ts");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            err.root_cause(),
            HlsDownloaderError::ProtocolError { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_key_is_key_error() {
        let processor = processor_for(MockServer::default().with("http://h/s0.ts", vec![0u8; 16]));
        let descriptor =
            SegmentDescriptor::new(0, "http://h/s0.ts").with_key(KeyRef::new("http://h/nokey"));
        let err = processor
            .process(&SegmentTask::new(descriptor, None))
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), HlsDownloaderError::KeyError { .. }));
    }

    #[tokio::test]
    async fn test_short_key_is_decryption_error() {
        let processor = processor_for(
            MockServer::default()
                .with("http://h/s0.ts", vec![0u8; 32])
                .with("http://h/k", vec![1u8; 8]),
        );
        let descriptor =
            SegmentDescriptor::new(0, "http://h/s0.ts").with_key(KeyRef::new("http://h/k"));
        let err = processor
            .process(&SegmentTask::new(descriptor, None))
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            HlsDownloaderError::DecryptionError(_)
        ));
    }
}
