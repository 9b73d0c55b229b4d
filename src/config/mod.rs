//! Config loading and persistence.

mod load;
mod merge;
mod schema;

use std::path::PathBuf;

use thiserror::Error;

pub use load::{
    RUN_CONFIG_FILE, config_path, load, load_layer, run_config_path, write_config,
};
pub use merge::{apply_env_overrides, apply_overrides_from, merge_layers};
pub use schema::{
    Config, ConfigLayer, FileLoggingConfig, FileLoggingConfigOverride, LoadConfig,
    LoadConfigOverride, LogFormat, LoggingConfig, LoggingConfigOverride,
    ManifestConfig, ManifestConfigOverride, ScratchConfig, ScratchConfigOverride, StoreBackend,
    StoreConfig, StoreConfigOverride, ValidateConfig, ValidateConfigOverride,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path:?} does not exist")]
    NotFound { path: PathBuf },
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
