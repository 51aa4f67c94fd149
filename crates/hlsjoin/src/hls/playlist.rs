// HLS Playlist: the segment plan handed to the download pipeline, plus the
// adapter that builds it from a parsed m3u8 media playlist.

use crate::hls::HlsDownloaderError;
use crate::hls::fetcher::{ResourceKind, SegmentDownloader};
use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// A byte sub-range of a resource, sent as an HTTP `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// Builds a range, rejecting one whose end does not fit in a `u64`.
    pub fn new(offset: u64, length: u64) -> Result<Self, HlsDownloaderError> {
        offset
            .checked_add(length)
            .map(|_| Self { offset, length })
            .ok_or_else(|| {
                HlsDownloaderError::ConfigError(format!(
                    "byte range {length}@{offset} overflows"
                ))
            })
    }

    pub fn header_value(&self) -> String {
        let last = self.offset.saturating_add(self.length.saturating_sub(1));
        format!("bytes={}-{}", self.offset, last)
    }

    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Reference to an AES-128 key plus its optional explicit IV (hex string).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRef {
    pub uri: String,
    pub iv: Option<String>,
}

impl KeyRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            iv: None,
        }
    }

    pub fn with_iv(mut self, iv: impl Into<String>) -> Self {
        self.iv = Some(iv.into());
        self
    }

    /// The key that applies to a segment: its own when present with a
    /// non-empty URI, else the stream-wide default, else none.
    pub fn effective<'a>(
        own: Option<&'a KeyRef>,
        default: Option<&'a KeyRef>,
    ) -> Option<&'a KeyRef> {
        own.filter(|key| !key.uri.is_empty())
            .or_else(|| default.filter(|key| !key.uri.is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Position in playlist order, starting at 0.
    pub index: usize,
    pub uri: String,
    pub key: Option<KeyRef>,
    pub byte_range: Option<ByteRange>,
    /// Media segment number the implicit IV is derived from. Init sections
    /// take the number of the media segment they precede, so they never shift
    /// the IVs of the media segments.
    pub iv_sequence: usize,
    /// `EXT-X-MAP` initialization section rather than a media segment.
    pub init_section: bool,
}

impl SegmentDescriptor {
    pub fn new(index: usize, uri: impl Into<String>) -> Self {
        Self {
            index,
            uri: uri.into(),
            key: None,
            byte_range: None,
            iv_sequence: index,
            init_section: false,
        }
    }

    pub fn with_key(mut self, key: KeyRef) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_iv_sequence(mut self, iv_sequence: usize) -> Self {
        self.iv_sequence = iv_sequence;
        self
    }
}

/// Ordered segments, the stream-wide default key and where the playlist came from.
#[derive(Debug, Clone, Default)]
pub struct PlaylistPlan {
    pub segments: Vec<SegmentDescriptor>,
    pub default_key: Option<KeyRef>,
    pub source_url: Option<Url>,
}

impl PlaylistPlan {
    pub fn new(segments: Vec<SegmentDescriptor>, default_key: Option<KeyRef>) -> Self {
        Self {
            segments,
            default_key,
            source_url: None,
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Builds the plan from a parsed media playlist.
    ///
    /// An `EXT-X-KEY` applies to every following segment until the next key
    /// tag; `METHOD=NONE` clears it. Relative URIs are resolved against
    /// `source_url`. Init sections (`EXT-X-MAP`) are emitted once, ahead of the
    /// first segment that references them. A parsed playlist does not record
    /// whether a segment's `EXT-X-MAP` came before or after its `EXT-X-KEY`,
    /// so the init section gets the key in force before that segment's tags.
    pub fn from_media_playlist(
        playlist: &MediaPlaylist,
        source_url: Option<Url>,
    ) -> Result<Self, HlsDownloaderError> {
        Self::build(playlist, source_url, &[])
    }

    /// `key_precedes_map[n]` tells whether media segment `n` declared its
    /// `EXT-X-KEY` ahead of its `EXT-X-MAP`; missing entries mean it did not.
    fn build(
        playlist: &MediaPlaylist,
        source_url: Option<Url>,
        key_precedes_map: &[bool],
    ) -> Result<Self, HlsDownloaderError> {
        let base = source_url.as_ref();
        let mut segments = Vec::with_capacity(playlist.segments.len());
        let mut current_key: Option<KeyRef> = None;
        let mut current_map: Option<String> = None;
        let mut previous_range: Option<(String, ByteRange)> = None;

        for (sequence, segment) in playlist.segments.iter().enumerate() {
            let key_before_map = key_precedes_map.get(sequence).copied().unwrap_or(false);
            let key_in_force = current_key.clone();

            if let Some(key) = &segment.key {
                current_key = match &key.method {
                    KeyMethod::None => None,
                    KeyMethod::AES128 => {
                        let key_uri = key
                            .uri
                            .as_deref()
                            .filter(|uri| !uri.is_empty())
                            .ok_or_else(|| {
                                HlsDownloaderError::ConfigError(
                                    "AES-128 key tag without URI".to_string(),
                                )
                            })?;
                        Some(KeyRef {
                            uri: resolve_uri(base, key_uri)?,
                            iv: key.iv.clone(),
                        })
                    }
                    other => {
                        return Err(HlsDownloaderError::ConfigError(format!(
                            "Unsupported encryption method: {other:?}"
                        )));
                    }
                };
            }

            if let Some(map) = &segment.map {
                let map_uri = resolve_uri(base, &map.uri)?;
                if current_map.as_deref() != Some(map_uri.as_str()) {
                    let byte_range = map
                        .byte_range
                        .as_ref()
                        .map(|range| ByteRange::new(range.offset.unwrap_or(0), range.length))
                        .transpose()?;
                    let key = if key_before_map {
                        current_key.clone()
                    } else {
                        key_in_force
                    };
                    segments.push(SegmentDescriptor {
                        index: segments.len(),
                        uri: map_uri.clone(),
                        key,
                        byte_range,
                        iv_sequence: sequence,
                        init_section: true,
                    });
                    current_map = Some(map_uri);
                }
            }

            let uri = resolve_uri(base, &segment.uri)?;
            let byte_range = segment
                .byte_range
                .as_ref()
                .map(|range| {
                    // Without an offset the sub-range continues the previous one of the same resource
                    let offset = range.offset.unwrap_or_else(|| match &previous_range {
                        Some((previous_uri, previous)) if *previous_uri == uri => previous.end(),
                        _ => 0,
                    });
                    ByteRange::new(offset, range.length)
                })
                .transpose()?;
            previous_range = byte_range.map(|range| (uri.clone(), range));

            segments.push(SegmentDescriptor {
                index: segments.len(),
                uri,
                key: current_key.clone(),
                byte_range,
                iv_sequence: sequence,
                init_section: false,
            });
        }

        debug!(segments = segments.len(), "Built segment plan");

        Ok(Self {
            segments,
            default_key: None,
            source_url,
        })
    }

    /// Parses playlist bytes. Master playlists are rejected.
    pub fn parse(data: &[u8], source_url: Option<Url>) -> Result<Self, HlsDownloaderError> {
        match m3u8_rs::parse_playlist_res(data) {
            Ok(Playlist::MediaPlaylist(playlist)) => {
                Self::build(&playlist, source_url, &key_precedes_map(data))
            }
            Ok(Playlist::MasterPlaylist(_)) => Err(HlsDownloaderError::PlaylistError(
                "unsupported playlist type: master playlist".to_string(),
            )),
            Err(e) => Err(HlsDownloaderError::PlaylistError(format!(
                "failed to parse playlist: {e:?}"
            ))),
        }
    }

    /// File name of the first segment's URI, used when no output path is given.
    pub fn default_output_name(&self) -> Option<String> {
        let first = self.segments.first()?;
        let path = match Url::parse(&first.uri) {
            Ok(url) => url.path().to_string(),
            Err(_) => first.uri.split(['?', '#']).next().unwrap_or_default().to_string(),
        };
        path.rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}

/// Resolves a segment or key URI against the playlist's own URL.
///
/// URIs starting with `http` are returned unchanged. Relative URIs need a base;
/// without one (playlist read from a local file) they are a configuration error.
pub fn resolve_uri(base: Option<&Url>, uri: &str) -> Result<String, HlsDownloaderError> {
    if uri.starts_with("http") {
        return Ok(uri.to_string());
    }

    let base = base.ok_or_else(|| {
        HlsDownloaderError::ConfigError(format!(
            "relative URI {uri} needs the playlist URL to be resolved"
        ))
    })?;

    base.join(uri).map(|url| url.to_string()).map_err(|e| {
        HlsDownloaderError::ConfigError(format!("Could not join base URL {base} with {uri}: {e}"))
    })
}

/// For each media segment, whether its tag block declared `EXT-X-KEY` before
/// `EXT-X-MAP`. The key then also covers the init section.
fn key_precedes_map(data: &[u8]) -> Vec<bool> {
    let mut flags = Vec::new();
    let mut saw_key = false;
    let mut key_first = false;

    for line in String::from_utf8_lossy(data).lines().map(str::trim) {
        if line.starts_with("#EXT-X-KEY") {
            saw_key = true;
        } else if line.starts_with("#EXT-X-MAP") {
            key_first = saw_key;
        } else if !line.is_empty() && !line.starts_with('#') {
            flags.push(key_first);
            saw_key = false;
            key_first = false;
        }
    }
    flags
}

/// Loads playlists from the network or from disk and turns them into plans.
pub struct PlaylistLoader {
    downloader: Arc<dyn SegmentDownloader>,
}

impl PlaylistLoader {
    pub fn new(downloader: Arc<dyn SegmentDownloader>) -> Self {
        Self { downloader }
    }

    /// Fetches the playlist with the segment retry policy and resolves its URIs against `url`.
    pub async fn load_url(&self, url: &str) -> Result<PlaylistPlan, HlsDownloaderError> {
        let source_url = Url::parse(url).map_err(|e| {
            HlsDownloaderError::ConfigError(format!("Invalid playlist URL {url}: {e}"))
        })?;
        let data = self
            .downloader
            .fetch(url, ResourceKind::Playlist, None)
            .await?;
        let plan = PlaylistPlan::parse(&data, Some(source_url))?;
        info!(%url, segments = plan.len(), "Parsed playlist");
        Ok(plan)
    }

    /// Reads a local playlist. Relative URIs resolve against `base_url` when given.
    pub async fn load_file(
        path: &Path,
        base_url: Option<Url>,
    ) -> Result<PlaylistPlan, HlsDownloaderError> {
        let data = tokio::fs::read(path).await?;
        let plan = PlaylistPlan::parse(&data, base_url)?;
        info!(path = %path.display(), segments = plan.len(), "Parsed playlist");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCRYPTED_PLAYLIST: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-KEY:METHOD=AES-128,URI=\"key1.bin\"
#EXTINF:10.0,
seg000.ts
#EXTINF:10.0,
seg001.ts
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/key2.bin\",IV=0x0102030405060708090a0b0c0d0e0f10
#EXTINF:10.0,
seg002.ts
#EXT-X-KEY:METHOD=NONE
#EXTINF:10.0,
http://cdn.example.com/seg003.ts
#EXT-X-ENDLIST
";

    fn base() -> Url {
        Url::parse("http://host/path/stream.m3u8").unwrap()
    }

    #[test]
    fn test_resolve_relative_uri() {
        let base = base();
        assert_eq!(
            resolve_uri(Some(&base), "seg001.ts").unwrap(),
            "http://host/path/seg001.ts"
        );
        assert_eq!(
            resolve_uri(Some(&base), "/root/seg001.ts").unwrap(),
            "http://host/root/seg001.ts"
        );
    }

    #[test]
    fn test_resolve_absolute_uri_unchanged() {
        let base = base();
        let uri = "https://other.example.com/a/seg.ts?token=1";
        assert_eq!(resolve_uri(Some(&base), uri).unwrap(), uri);
        assert_eq!(resolve_uri(None, uri).unwrap(), uri);
    }

    #[test]
    fn test_relative_uri_without_base_is_config_error() {
        let err = resolve_uri(None, "seg001.ts").unwrap_err();
        assert!(matches!(err, HlsDownloaderError::ConfigError(_)));
    }

    #[test]
    fn test_parse_carries_keys_forward() {
        let plan = PlaylistPlan::parse(ENCRYPTED_PLAYLIST.as_bytes(), Some(base())).unwrap();
        assert_eq!(plan.len(), 4);

        let indices: Vec<usize> = plan.segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        assert_eq!(plan.segments[0].uri, "http://host/path/seg000.ts");
        let key1 = KeyRef::new("http://host/path/key1.bin");
        assert_eq!(plan.segments[0].key.as_ref(), Some(&key1));
        assert_eq!(plan.segments[1].key.as_ref(), Some(&key1));

        let key2 = plan.segments[2].key.as_ref().unwrap();
        assert_eq!(key2.uri, "https://keys.example.com/key2.bin");
        assert_eq!(
            key2.iv.as_deref(),
            Some("0x0102030405060708090a0b0c0d0e0f10")
        );

        assert_eq!(plan.segments[3].uri, "http://cdn.example.com/seg003.ts");
        assert!(plan.segments[3].key.is_none());
    }

    #[test]
    fn test_parse_local_file_with_relative_uri_fails() {
        let err = PlaylistPlan::parse(ENCRYPTED_PLAYLIST.as_bytes(), None).unwrap_err();
        assert!(matches!(err, HlsDownloaderError::ConfigError(_)));
    }

    #[test]
    fn test_parse_absolute_playlist_without_base() {
        let playlist = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXTINF:4.0,
http://host/a.ts
#EXTINF:4.0,
http://host/b.ts
#EXT-X-ENDLIST
";
        let plan = PlaylistPlan::parse(playlist.as_bytes(), None).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.default_output_name().as_deref(), Some("a.ts"));
    }

    #[test]
    fn test_parse_rejects_master_playlist() {
        let master = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1280000
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2560000
high/index.m3u8
";
        let err = PlaylistPlan::parse(master.as_bytes(), Some(base())).unwrap_err();
        assert!(matches!(err, HlsDownloaderError::PlaylistError(_)));
    }

    #[test]
    fn test_parse_rejects_sample_aes() {
        let playlist = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"key.bin\"
#EXTINF:4.0,
a.ts
#EXT-X-ENDLIST
";
        let err = PlaylistPlan::parse(playlist.as_bytes(), Some(base())).unwrap_err();
        assert!(matches!(err, HlsDownloaderError::ConfigError(_)));
    }

    #[test]
    fn test_parse_byte_ranges_continue_previous_range() {
        let playlist = "#EXTM3U
#EXT-X-VERSION:4
#EXT-X-TARGETDURATION:4
#EXTINF:4.0,
#EXT-X-BYTERANGE:1000@0
media.ts
#EXTINF:4.0,
#EXT-X-BYTERANGE:500
media.ts
#EXT-X-ENDLIST
";
        let plan = PlaylistPlan::parse(playlist.as_bytes(), Some(base())).unwrap();
        assert_eq!(
            plan.segments[0].byte_range,
            Some(ByteRange {
                offset: 0,
                length: 1000
            })
        );
        assert_eq!(
            plan.segments[1].byte_range,
            Some(ByteRange {
                offset: 1000,
                length: 500
            })
        );
        assert_eq!(
            plan.segments[1].byte_range.unwrap().header_value(),
            "bytes=1000-1499"
        );
    }

    #[test]
    fn test_parse_emits_init_section_once() {
        let playlist = "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:4
#EXT-X-MAP:URI=\"init.mp4\"
#EXTINF:4.0,
seg1.m4s
#EXTINF:4.0,
seg2.m4s
#EXT-X-ENDLIST
";
        let plan = PlaylistPlan::parse(playlist.as_bytes(), Some(base())).unwrap();
        let uris: Vec<&str> = plan.segments.iter().map(|s| s.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec![
                "http://host/path/init.mp4",
                "http://host/path/seg1.m4s",
                "http://host/path/seg2.m4s"
            ]
        );
        assert_eq!(plan.segments[2].index, 2);

        let sequences: Vec<usize> = plan.segments.iter().map(|s| s.iv_sequence).collect();
        assert_eq!(sequences, vec![0, 0, 1]);
        assert!(plan.segments[0].init_section);
        assert!(!plan.segments[1].init_section);
    }

    const FMP4_MAP_THEN_KEY: &str = "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:4
#EXT-X-MAP:URI=\"init.mp4\"
#EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"
#EXTINF:4.0,
seg0.m4s
#EXTINF:4.0,
seg1.m4s
#EXT-X-ENDLIST
";

    #[test]
    fn test_init_section_declared_before_key_stays_clear() {
        let plan = PlaylistPlan::parse(FMP4_MAP_THEN_KEY.as_bytes(), Some(base())).unwrap();
        let key = KeyRef::new("http://host/path/k.bin");

        assert_eq!(plan.segments[0].uri, "http://host/path/init.mp4");
        assert!(plan.segments[0].key.is_none());
        assert_eq!(plan.segments[1].key.as_ref(), Some(&key));
        assert_eq!(plan.segments[1].iv_sequence, 0);
        assert_eq!(plan.segments[2].key.as_ref(), Some(&key));
        assert_eq!(plan.segments[2].iv_sequence, 1);
    }

    #[test]
    fn test_init_section_declared_after_key_is_encrypted() {
        let playlist = FMP4_MAP_THEN_KEY.replace(
            "#EXT-X-MAP:URI=\"init.mp4\"\n#EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"",
            "#EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"\n#EXT-X-MAP:URI=\"init.mp4\"",
        );
        let plan = PlaylistPlan::parse(playlist.as_bytes(), Some(base())).unwrap();

        assert!(plan.segments[0].init_section);
        assert_eq!(
            plan.segments[0].key.as_ref(),
            Some(&KeyRef::new("http://host/path/k.bin"))
        );
    }

    #[test]
    fn test_from_media_playlist_keeps_init_section_clear() {
        let Ok(Playlist::MediaPlaylist(playlist)) =
            m3u8_rs::parse_playlist_res(FMP4_MAP_THEN_KEY.as_bytes())
        else {
            panic!("expected a media playlist");
        };
        let plan = PlaylistPlan::from_media_playlist(&playlist, Some(base())).unwrap();
        assert!(plan.segments[0].key.is_none());
        assert!(plan.segments[1].key.is_some());
    }

    #[test]
    fn test_overflowing_byte_range_is_config_error() {
        let playlist = "#EXTM3U
#EXT-X-VERSION:4
#EXT-X-TARGETDURATION:4
#EXTINF:4.0,
#EXT-X-BYTERANGE:10@18446744073709551610
media.ts
#EXT-X-ENDLIST
";
        let err = PlaylistPlan::parse(playlist.as_bytes(), Some(base())).unwrap_err();
        assert!(matches!(err, HlsDownloaderError::ConfigError(_)));

        assert!(ByteRange::new(u64::MAX, 1).is_err());
        assert_eq!(
            ByteRange::new(u64::MAX - 1, 1).unwrap().header_value(),
            format!("bytes={}-{}", u64::MAX - 1, u64::MAX - 1)
        );
    }

    #[test]
    fn test_effective_key_prefers_segment_key() {
        let own = KeyRef::new("http://host/own.key");
        let default = KeyRef::new("http://host/default.key");
        let empty = KeyRef::new("");

        assert_eq!(KeyRef::effective(Some(&own), Some(&default)), Some(&own));
        assert_eq!(KeyRef::effective(None, Some(&default)), Some(&default));
        assert_eq!(KeyRef::effective(Some(&empty), Some(&default)), Some(&default));
        assert_eq!(KeyRef::effective(None, None), None);
    }

    #[tokio::test]
    async fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.m3u8");
        tokio::fs::write(&path, ENCRYPTED_PLAYLIST).await.unwrap();

        let plan = PlaylistLoader::load_file(&path, Some(base())).await.unwrap();
        assert_eq!(plan.len(), 4);
        assert!(PlaylistLoader::load_file(&path, None).await.is_err());
    }
}
