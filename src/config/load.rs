use std::fs;
use std::path::{Path, PathBuf};

use super::merge::{apply_env_overrides, merge_layers};
use super::{Config, ConfigError, ConfigLayer};

pub const RUN_CONFIG_FILE: &str = "keyshift.toml";

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

pub fn run_config_path(dir: &Path) -> PathBuf {
    dir.join(RUN_CONFIG_FILE)
}

/// Parse one config file. A missing file is not an error.
pub fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Defaults, user file, run file, then `KEYSHIFT_*` overrides.
///
/// The run file is `explicit` when given (and must exist), otherwise
/// `keyshift.toml` in the working directory if present.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let user = load_layer(&config_path())?;
    let run = match explicit {
        Some(path) => Some(load_layer(path)?.ok_or_else(|| ConfigError::NotFound {
            path: path.to_path_buf(),
        })?),
        None => match std::env::current_dir() {
            Ok(cwd) => load_layer(&run_config_path(&cwd))?,
            Err(_) => None,
        },
    };
    let mut config = merge_layers(user.into_iter().chain(run));
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let contents = toml::to_string_pretty(cfg)?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(write_err)?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    fs::write(temp.path(), data).map_err(write_err)?;
    temp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}
