use clap::{ArgGroup, Parser};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Download an HLS media playlist into a single file",
    long_about = "Downloads every segment of an HLS media playlist concurrently,\n\
                  decrypts AES-128 encrypted segments and joins them into one file\n\
                  in playlist order. The playlist can be fetched from a URL or read\n\
                  from a local .m3u8 file.",
    group(ArgGroup::new("input").required(true).args(["url", "m3u8_file"]))
)]
pub struct CliArgs {
    /// Media playlist URL
    #[arg(short = 'u', long, help = "URL of the media playlist (.m3u8) to download")]
    pub url: Option<String>,

    /// Local media playlist
    #[arg(
        short = 'f',
        long = "m3u8-file",
        help = "Path to a local media playlist. Segment URIs must be absolute unless --base-url is given"
    )]
    pub m3u8_file: Option<PathBuf>,

    /// Base URL for relative URIs in a local playlist
    #[arg(
        long,
        requires = "m3u8_file",
        help = "URL that relative segment and key URIs of a local playlist are resolved against"
    )]
    pub base_url: Option<String>,

    /// Number of concurrent segment downloads
    #[arg(
        short = 'n',
        long = "thread-number",
        default_value = "10",
        help = "Number of concurrent segment downloads (0 uses the default of 10)"
    )]
    pub thread_number: usize,

    /// Output file
    #[arg(
        short = 'o',
        long = "out-file",
        help = "Output file (default: file name of the first segment)"
    )]
    pub out_file: Option<PathBuf>,

    /// Retry attempts per request
    #[arg(
        short = 'r',
        long,
        default_value = "3",
        help = "Number of retries for a failed segment, key or playlist request"
    )]
    pub retry: u32,

    /// Request timeout in seconds
    #[arg(
        short = 't',
        long,
        default_value = "30",
        help = "Timeout in seconds for each HTTP request (0 uses the default of 30)"
    )]
    pub timeout: u64,

    /// Proxy URL (e.g., "http://proxy.example.com:8080")
    #[arg(
        short = 'p',
        long,
        help = "Proxy server URL (http://, https://, socks5://). Credentials may be embedded in the URL"
    )]
    pub proxy: Option<String>,

    /// Disable all proxy settings for downloads
    #[arg(
        long,
        conflicts_with = "proxy",
        help = "Disable all proxy settings (including system proxy)"
    )]
    pub no_proxy: bool,

    /// Custom HTTP headers for download requests
    #[arg(
        long = "header",
        short = 'H',
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Show progress bar
    #[arg(
        short = 'P',
        long = "progress",
        default_value = "false",
        help = "Show a progress bar while segments are downloaded"
    )]
    pub show_progress: bool,

    /// Keep the partial output file when the download fails
    #[arg(long, help = "Keep the incomplete output file when the download fails")]
    pub keep_partial: bool,

    /// Also write logs to this file
    #[arg(long, value_name = "PATH", help = "Also write logs to the given file")]
    pub log_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::try_parse_from(["hlsjoin", "-u", "http://host/index.m3u8"]).unwrap();
        assert_eq!(args.url.as_deref(), Some("http://host/index.m3u8"));
        assert_eq!(args.thread_number, 10);
        assert_eq!(args.retry, 3);
        assert_eq!(args.timeout, 30);
        assert!(args.out_file.is_none());
        assert!(!args.keep_partial);
    }

    #[test]
    fn test_short_flags() {
        let args = CliArgs::try_parse_from([
            "hlsjoin", "-f", "list.m3u8", "-n", "4", "-o", "out.ts", "-r", "0", "-t", "5", "-H",
            "Referer: http://host", "-H", "X-Token: abc", "-P", "-v",
        ])
        .unwrap();
        assert_eq!(args.m3u8_file, Some(PathBuf::from("list.m3u8")));
        assert_eq!(args.thread_number, 4);
        assert_eq!(args.out_file, Some(PathBuf::from("out.ts")));
        assert_eq!(args.retry, 0);
        assert_eq!(args.timeout, 5);
        assert_eq!(args.headers.len(), 2);
        assert!(args.show_progress);
        assert!(args.verbose);
    }

    #[test]
    fn test_input_is_required() {
        assert!(CliArgs::try_parse_from(["hlsjoin", "-n", "4"]).is_err());
    }

    #[test]
    fn test_url_and_file_are_exclusive() {
        assert!(
            CliArgs::try_parse_from(["hlsjoin", "-u", "http://h/a.m3u8", "-f", "a.m3u8"]).is_err()
        );
    }
}
