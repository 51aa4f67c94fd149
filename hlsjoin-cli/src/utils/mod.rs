mod files;
mod headers;
pub mod progress;
mod size;
mod time;

// Export utility functions
pub use self::files::{prepare_output, resolve_output_path};
pub use self::headers::parse_headers;
pub use self::size::format_bytes;
pub use self::time::format_duration;
