use std::{sync::Arc, time::Duration};

use clap::Parser;
use error::AppError;
use hlsjoin_engine::hls::PartialOutputPolicy;
use hlsjoin_engine::{DownloaderConfig, HlsConfig, HlsDownloader, PlaylistPlan, ProxyConfig};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

mod cli;
mod error;
mod utils;

use cli::CliArgs;
use utils::progress::ProgressManager;
use utils::{format_bytes, format_duration, parse_headers, prepare_output, resolve_output_path};

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        // Log the full error for debugging
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

fn init_logging(args: &CliArgs) -> Result<(), AppError> {
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hlsjoin={default_level},hlsjoin_engine={default_level}")));

    let writer = match &args.log_file {
        Some(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            BoxMakeWriter::new(MakeWriterExt::and(std::io::stderr, log_file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(args.log_file.is_none())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))
}

fn build_config(args: &CliArgs) -> Result<HlsConfig, AppError> {
    let mut builder = DownloaderConfig::builder()
        .with_timeout(Duration::from_secs(args.timeout))
        .with_headers(parse_headers(&args.headers)?);

    if let Some(proxy_url) = &args.proxy {
        let proxy = ProxyConfig::from_url(proxy_url).map_err(AppError::InvalidInput)?;
        info!(
            proxy_url = %proxy.url,
            proxy_type = ?proxy.proxy_type,
            has_auth = proxy.auth.is_some(),
            "Using explicit proxy configuration for downloads"
        );
        builder = builder.with_proxy(proxy);
    } else if args.no_proxy {
        info!("All proxy settings disabled (--no-proxy flag)");
        builder = builder.with_system_proxy(false);
    }

    let partial_output_policy = if args.keep_partial {
        PartialOutputPolicy::Keep
    } else {
        PartialOutputPolicy::Delete
    };

    Ok(HlsConfig::builder()
        .with_base_config(builder.build())
        .timeout(Duration::from_secs(args.timeout))
        .worker_count(args.thread_number)
        .retry_count(args.retry)
        .partial_output_policy(partial_output_policy)
        .build())
}

async fn load_plan(downloader: &HlsDownloader, args: &CliArgs) -> Result<PlaylistPlan, AppError> {
    match (&args.url, &args.m3u8_file) {
        (Some(url), _) => Ok(downloader.load_url(url).await?),
        (None, Some(path)) => Ok(downloader
            .load_file(path, args.base_url.as_deref())
            .await?),
        (None, None) => Err(AppError::InvalidInput(
            "either --url or --m3u8-file is required".to_string(),
        )),
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    // Parse command-line arguments
    let args = CliArgs::parse();
    init_logging(&args)?;

    let config = build_config(&args)?;
    info!(
        workers = config.scheduler_config.worker_count,
        retries = config.fetcher_config.max_segment_retries,
        timeout_s = config.base.timeout.as_secs(),
        "HLS download configuration"
    );

    let progress_manager = if args.show_progress {
        ProgressManager::new()
    } else {
        ProgressManager::new_disabled()
    };
    let progress = progress_manager.clone();
    let downloader = HlsDownloader::new(config)?.with_progress(Arc::new(move |event| {
        progress.handle_event(event);
    }));

    let cancel = downloader.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling download");
            cancel.cancel();
        }
    });

    let plan = load_plan(&downloader, &args).await?;
    if plan.is_empty() {
        warn!("Playlist contains no segments");
    }

    let output = resolve_output_path(args.out_file.as_deref(), &plan);
    prepare_output(&output).await?;
    debug!(output = %output.display(), "Resolved output path");

    let result = downloader.download_plan(&plan, &output).await;
    progress_manager.abandon();
    let summary = result?;

    info!(
        "Saved {} segments ({}) to {} in {}",
        summary.segments,
        format_bytes(summary.bytes_written),
        summary.path.display(),
        format_duration(summary.elapsed)
    );
    Ok(())
}
