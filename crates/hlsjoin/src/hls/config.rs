use std::time::Duration;

use crate::DownloaderConfig;
use crate::config::DEFAULT_TIMEOUT;

/// Worker count used when none (or zero) is configured.
pub const DEFAULT_WORKER_COUNT: usize = 10;

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct HlsConfig {
    /// Base downloader configuration
    pub base: DownloaderConfig,
    pub scheduler_config: HlsSchedulerConfig,
    pub fetcher_config: HlsFetcherConfig,
    pub decryption_config: HlsDecryptionConfig,
    pub output_config: HlsOutputConfig,
}

impl HlsConfig {
    pub fn builder() -> HlsConfigBuilder {
        HlsConfigBuilder::new()
    }

    /// Repairs values that would stall or misconfigure a download:
    /// a zero worker count falls back to the default, a zero queue capacity
    /// follows the worker count and zero timeouts fall back to the default.
    pub fn normalized(mut self) -> Self {
        if self.scheduler_config.worker_count == 0 {
            self.scheduler_config.worker_count = DEFAULT_WORKER_COUNT;
        }
        if self.scheduler_config.queue_capacity == 0 {
            self.scheduler_config.queue_capacity = self.scheduler_config.worker_count * 2;
        }
        if self.base.timeout.is_zero() {
            self.base.timeout = DEFAULT_TIMEOUT;
        }
        if self.fetcher_config.segment_download_timeout.is_zero() {
            self.fetcher_config.segment_download_timeout = self.base.timeout;
        }
        if self.fetcher_config.key_download_timeout.is_zero() {
            self.fetcher_config.key_download_timeout = self.base.timeout;
        }
        if self.fetcher_config.max_retry_delay < self.fetcher_config.retry_delay_base {
            self.fetcher_config.max_retry_delay = self.fetcher_config.retry_delay_base;
        }
        self
    }
}

// --- Scheduler Configuration ---
#[derive(Debug, Clone)]
pub struct HlsSchedulerConfig {
    /// Number of concurrent segment workers
    pub worker_count: usize,
    /// Capacity of the task queue feeding the workers. Zero means `2 * worker_count`.
    pub queue_capacity: usize,
}

impl Default for HlsSchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: 0,
        }
    }
}

// --- Fetcher Configuration ---
#[derive(Debug, Clone)]
pub struct HlsFetcherConfig {
    pub segment_download_timeout: Duration,
    /// Additional attempts after the first one for segments and playlists
    pub max_segment_retries: u32,
    pub key_download_timeout: Duration,
    /// Additional attempts after the first one for decryption keys
    pub max_key_retries: u32,
    /// Base for exponential backoff between attempts. Zero retries immediately.
    pub retry_delay_base: Duration,
    /// Upper bound for a single backoff delay
    pub max_retry_delay: Duration,
}

impl Default for HlsFetcherConfig {
    fn default() -> Self {
        Self {
            segment_download_timeout: DEFAULT_TIMEOUT,
            max_segment_retries: 3,
            key_download_timeout: Duration::from_secs(10),
            max_key_retries: 3,
            retry_delay_base: Duration::from_millis(200),
            max_retry_delay: Duration::from_secs(2),
        }
    }
}

impl HlsFetcherConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay_base
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

// --- Decryption Configuration ---
#[derive(Debug, Clone, Default)]
pub struct HlsDecryptionConfig {
    /// Run AES decryption on tokio's blocking thread pool instead of the worker task
    pub offload_decryption_to_cpu_pool: bool,
}

/// What happens to the output file when a download fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartialOutputPolicy {
    /// Remove the incomplete file.
    #[default]
    Delete,
    /// Leave the incomplete file in place for inspection.
    Keep,
}

// --- Output Configuration ---
#[derive(Debug, Clone)]
pub struct HlsOutputConfig {
    pub partial_output_policy: PartialOutputPolicy,
    /// Capacity of the buffered writer in front of the output file
    pub write_buffer_size: usize,
}

impl Default for HlsOutputConfig {
    fn default() -> Self {
        Self {
            partial_output_policy: PartialOutputPolicy::default(),
            write_buffer_size: 256 * 1024,
        }
    }
}

/// Fluent builder for [`HlsConfig`].
#[derive(Debug, Clone, Default)]
pub struct HlsConfigBuilder {
    config: HlsConfig,
}

impl HlsConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_config(mut self, base_config: DownloaderConfig) -> Self {
        self.config.base = base_config;
        self
    }

    /// Set overall HTTP timeout, also used for segment and key requests
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.base.timeout = timeout;
        self.config.fetcher_config.segment_download_timeout = timeout;
        self.config.fetcher_config.key_download_timeout = timeout;
        self
    }

    /// Set the number of concurrent segment workers
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.scheduler_config.worker_count = count;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.scheduler_config.queue_capacity = capacity;
        self
    }

    /// Set the retry budget for segments, playlists and keys
    pub fn retry_count(mut self, retries: u32) -> Self {
        self.config.fetcher_config.max_segment_retries = retries;
        self.config.fetcher_config.max_key_retries = retries;
        self
    }

    pub fn segment_retry_count(mut self, retries: u32) -> Self {
        self.config.fetcher_config.max_segment_retries = retries;
        self
    }

    pub fn key_retry_count(mut self, retries: u32) -> Self {
        self.config.fetcher_config.max_key_retries = retries;
        self
    }

    pub fn retry_delay(mut self, base: Duration, max: Duration) -> Self {
        self.config.fetcher_config.retry_delay_base = base;
        self.config.fetcher_config.max_retry_delay = max;
        self
    }

    pub fn offload_decryption(mut self, enabled: bool) -> Self {
        self.config.decryption_config.offload_decryption_to_cpu_pool = enabled;
        self
    }

    pub fn partial_output_policy(mut self, policy: PartialOutputPolicy) -> Self {
        self.config.output_config.partial_output_policy = policy;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.output_config.write_buffer_size = size;
        self
    }

    /// Returns the normalized configuration
    pub fn build(self) -> HlsConfig {
        self.config.normalized()
    }
}
