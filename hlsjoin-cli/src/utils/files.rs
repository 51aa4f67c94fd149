use std::path::{Path, PathBuf};

use hlsjoin_engine::PlaylistPlan;

use crate::error::AppError;

/// Name used when neither an output file nor a usable segment name is available.
const FALLBACK_OUTPUT_NAME: &str = "output.ts";

/// Creates all directories in the given path, including parent directories if they don't exist.
#[inline]
pub async fn create_dirs(path: &Path) -> Result<(), AppError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(AppError::Io)?;
    Ok(())
}

/// The explicit output path, or the file name of the first segment in the
/// current directory.
pub fn resolve_output_path(out_file: Option<&Path>, plan: &PlaylistPlan) -> PathBuf {
    match out_file {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(
            plan.default_output_name()
                .unwrap_or_else(|| FALLBACK_OUTPUT_NAME.to_string()),
        ),
    }
}

/// Makes sure the directory that will hold `output` exists.
pub async fn prepare_output(output: &Path) -> Result<(), AppError> {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => create_dirs(parent).await,
        _ => Ok(()),
    }
}
