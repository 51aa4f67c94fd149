// HLS download pipeline: playlist plan, worker pool, decryption and ordered output

pub mod config;
pub mod coordinator;
pub mod decryption;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod hls_downloader;
pub mod key_cache;
pub mod output;
pub mod playlist;
pub mod processor;
pub mod scheduler;

// Re-exports for easier access
pub use config::{HlsConfig, HlsConfigBuilder, PartialOutputPolicy};
pub use coordinator::{DownloadSummary, HlsStreamCoordinator};
pub use error::HlsDownloaderError;
pub use events::{DownloadEvent, OnProgress};
pub use fetcher::{ResourceKind, SegmentDownloader, SegmentFetcher};
pub use hls_downloader::HlsDownloader;
pub use playlist::{ByteRange, KeyRef, PlaylistLoader, PlaylistPlan, SegmentDescriptor, resolve_uri};
