//! XDG directory helpers for config/data/log locations.

use std::path::PathBuf;

const APP_DIR: &str = "keyshift";

/// Base directory for persistent data (default store, run outputs).
///
/// Uses `KEYSHIFT_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/keyshift` or
/// `~/.local/share/keyshift`.
pub fn data_dir() -> PathBuf {
    data_dir_from(|name| std::env::var(name).ok())
}

fn data_dir_from(var: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(dir) = var("KEYSHIFT_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    var("XDG_DATA_HOME")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| home().join(".local").join("share"))
        .join(APP_DIR)
}

/// Default sqlite store file when none is configured.
pub fn default_store_path() -> PathBuf {
    data_dir().join("store.sqlite")
}

/// Default directory for per-run log files.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Base directory for configuration files.
///
/// Uses `KEYSHIFT_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/keyshift`
/// or `~/.config/keyshift`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KEYSHIFT_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| home().join(".config"))
        .join(APP_DIR)
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}
