use anyhow::Result;
use std::path::{Path, PathBuf};

const LOG_DIR_NAME: &str = "installer-logs";

/// Resolve the log folder (absolute path).
///
/// Prefers `<install_dir>/installer-logs/`. When the install directory cannot be created (e.g.
/// a dry run as an unprivileged user against `/opt`), falls back to the per-user state
/// directory, then to the system temp directory.
pub fn resolve_log_folder(install_dir: &Path) -> Result<PathBuf> {
    let candidate = install_dir.join(LOG_DIR_NAME);
    if std::fs::create_dir_all(&candidate).is_ok() {
        return Ok(absolutize(candidate));
    }

    if let Some(state) = dirs::state_dir().or_else(dirs::data_local_dir) {
        let candidate = state.join("stack-installer").join("logs");
        if std::fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let candidate = std::env::temp_dir().join("stack-installer-logs");
    std::fs::create_dir_all(&candidate)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder: {}", e))?;
    Ok(candidate)
}

/// Resolve the install directory given on the command line (absolute path).
pub fn resolve_install_dir(requested: Option<&Path>) -> Option<PathBuf> {
    requested.map(|p| absolutize(p.to_path_buf()))
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}
