use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Platform data directory for the registry database and access key,
/// created on first use.
pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("org", "certherd", "certherd")
        .context("cannot determine a data directory for this platform")?;
    let dir = dirs.data_local_dir().to_path_buf();
    std::fs::create_dir_all(&dir).context("create data dir")?;
    Ok(dir)
}
