//! # hlsjoin
//!
//! A library for downloading segmented HLS media streams into a single file.
//! Segments are fetched concurrently, decrypted when the playlist carries
//! AES-128 keys, and written to the output strictly in playlist order.
//!
//! ## Features
//!
//! - Bounded worker pool with an ordered task queue
//! - Per-request retries with bounded backoff
//! - Memoized decryption keys shared by all workers
//! - Reorder buffer that restores playlist order on the fly
//! - Fail-fast cancellation of the whole job on the first terminal error

pub mod builder;
pub mod config;
pub mod downloader;
pub mod error;
pub mod hls;
pub mod proxy;

pub use builder::DownloaderConfigBuilder;
pub use config::DownloaderConfig;
pub use error::DownloadError;

// Re-export downloader utilities
pub use downloader::create_client;

// Re-export the HLS façade and its main types
pub use hls::{
    DownloadEvent, DownloadSummary, HlsConfig, HlsConfigBuilder, HlsDownloader,
    HlsDownloaderError, HlsStreamCoordinator, KeyRef, OnProgress, PlaylistPlan,
    SegmentDescriptor,
};

// Re-export proxy utilities
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
