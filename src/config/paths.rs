//! Config directory resolution and config file loading.
//!
//! Uses the `dirs` crate to resolve the platform config directory:
//! - Linux:   `~/.config/dxsync/config.toml`
//! - macOS:   `~/Library/Application Support/dxsync/config.toml`

use std::path::{Path, PathBuf};

use crate::error::SyncError;

use super::types::SyncConfig;

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the dxsync config directory. Unlike the data directories of a
/// transfer tool, nothing is ever written here, so it is not created.
pub fn dxsync_config_dir() -> Result<PathBuf, SyncError> {
    let base = dirs::config_dir()
        .ok_or_else(|| SyncError::Config("Could not determine config directory".into()))?;
    Ok(base.join("dxsync"))
}

/// Load the engine configuration.
///
/// An explicit path must exist. Without one, the default location is
/// consulted and a missing file yields the built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<SyncConfig, SyncError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = dxsync_config_dir()?.join(CONFIG_FILE_NAME);
            if !path.exists() {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(SyncConfig::default());
            }
            path
        }
    };

    let contents = std::fs::read_to_string(&path).map_err(|e| {
        SyncError::Config(format!("Cannot read {}: {}", path.display(), e))
    })?;
    let config: SyncConfig = toml::from_str(&contents)?;
    tracing::debug!(path = %path.display(), ?config, "Loaded config");
    Ok(config)
}
