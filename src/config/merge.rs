use std::str::FromStr;

use super::{Config, ConfigLayer};

/// Defaults, then each layer in order. Later layers win.
pub fn merge_layers(layers: impl IntoIterator<Item = ConfigLayer>) -> Config {
    let mut config = Config::default();
    for layer in layers {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

/// `KEYSHIFT_*` overrides read through `lookup`. Unparseable values are
/// ignored with a warning.
pub fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| {
        lookup(name)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(raw) = var("KEYSHIFT_STORE_BACKEND")
        && let Some(backend) = parsed("KEYSHIFT_STORE_BACKEND", &raw)
    {
        config.store.backend = backend;
    }
    if let Some(raw) = var("KEYSHIFT_STORE_PATH") {
        config.store.path = Some(raw.into());
    }
    if let Some(raw) = var("KEYSHIFT_SCRATCH_PREFIX") {
        config.scratch.prefix = raw;
    }
    if let Some(raw) = var("KEYSHIFT_LOAD_POLICY")
        && let Some(policy) = parsed("KEYSHIFT_LOAD_POLICY", &raw)
    {
        config.load.policy = policy;
    }
    if let Some(raw) = var("KEYSHIFT_SAMPLE_SIZE")
        && let Some(size) = parsed("KEYSHIFT_SAMPLE_SIZE", &raw)
    {
        config.validate.sample_size = size;
    }
    if let Some(raw) = var("KEYSHIFT_MAX_ERRORS")
        && let Some(max) = parsed("KEYSHIFT_MAX_ERRORS", &raw)
    {
        config.manifest.max_errors = max;
    }
    if let Some(raw) = var("KEYSHIFT_LOG_DIR") {
        config.logging.file.enabled = true;
        config.logging.file.dir = Some(raw.into());
    }
}

fn parsed<T>(name: &str, raw: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw.parse() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("invalid {name}, ignoring: {err}");
            None
        }
    }
}
