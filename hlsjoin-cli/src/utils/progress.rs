use hlsjoin_engine::DownloadEvent;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use super::format_bytes;

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {pos}/{len} segments ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Renders download events as a single progress bar.
#[derive(Clone)]
pub struct ProgressManager {
    bar: Arc<Mutex<Option<ProgressBar>>>,
    bytes_written: Arc<AtomicU64>,
    disabled: bool,
}

impl ProgressManager {
    pub fn new() -> Self {
        Self {
            bar: Arc::new(Mutex::new(None)),
            bytes_written: Arc::new(AtomicU64::new(0)),
            disabled: false,
        }
    }

    pub fn new_disabled() -> Self {
        Self {
            disabled: true,
            ..Self::new()
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        let bar = match self.bar.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(bar) = bar.as_ref() {
            f(bar);
        }
    }

    pub fn handle_event(&self, event: DownloadEvent) {
        if self.disabled {
            return;
        }

        match event {
            DownloadEvent::Started { total } => {
                let bar = ProgressBar::with_draw_target(
                    Some(total as u64),
                    ProgressDrawTarget::stderr(),
                );
                bar.set_style(download_style());
                bar.set_message("Downloading segments");
                bar.enable_steady_tick(Duration::from_millis(500));
                if let Ok(mut slot) = self.bar.lock() {
                    *slot = Some(bar);
                }
            }
            DownloadEvent::SegmentCompleted { .. } => {}
            DownloadEvent::SegmentFailed { index, error, .. } => {
                self.with_bar(|bar| bar.println(format!("segment {index} failed: {error}")));
            }
            DownloadEvent::SegmentWritten { bytes, .. } => {
                let total = self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed)
                    + bytes as u64;
                self.with_bar(|bar| {
                    bar.inc(1);
                    bar.set_message(format!("Downloading segments, {} written", format_bytes(total)));
                });
            }
            DownloadEvent::Finished { segments, bytes } => {
                self.with_bar(|bar| {
                    bar.finish_with_message(format!(
                        "Finished {segments} segments, {}",
                        format_bytes(bytes)
                    ))
                });
            }
        }
    }

    /// Stops drawing, leaving the bar where it stopped.
    pub fn abandon(&self) {
        self.with_bar(|bar| {
            if !bar.is_finished() {
                bar.abandon();
            }
        });
    }
}
