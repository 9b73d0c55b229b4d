//! Logging setup: a stderr layer and an optional per-run log file behind one
//! `EnvFilter`.
//!
//! Every invocation is one batch run, so the file layer writes a fresh
//! `keyshift-<invocation>.log` and prunes older run logs once, before the
//! first event.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};
use uuid::Uuid;

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig};
use crate::paths;

const RUN_LOG_PREFIX: &str = "keyshift-";
const RUN_LOG_SUFFIX: &str = ".log";
const FILTER_ENV: &str = "KEYSHIFT_LOG";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self { verbosity, logging }
    }
}

/// Keeps the file writer flushing until dropped.
pub struct TelemetryGuard {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
    /// Log file for this invocation, when file logging is on.
    pub run_log: Option<PathBuf>,
}

/// Install the global subscriber. A second call leaves the first in place.
pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let default_level = level_from_verbosity(config.verbosity);
    let filter = match config.logging.filter.as_deref() {
        Some(directives) => EnvFilter::builder()
            .with_default_directive(default_level.into())
            .parse_lossy(directives),
        None => EnvFilter::builder()
            .with_default_directive(default_level.into())
            .with_env_var(FILTER_ENV)
            .from_env_lossy(),
    };

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.logging.stdout {
        layers.push(format_layer(
            config.logging.stdout_format,
            std::io::stderr,
            true,
        ));
    }

    let mut file_guard = None;
    let mut run_log = None;
    let mut pruned = Vec::new();
    let mut setup_error = None;
    if config.logging.file.enabled {
        let dir = resolve_log_dir(&config.logging.file);
        let name = run_log_name(Uuid::now_v7());
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                if let Some(keep) = config.logging.file.keep_runs {
                    match prune_run_logs(&dir, keep) {
                        Ok(removed) => pruned = removed,
                        Err(err) => setup_error = Some(format!("log pruning failed: {err}")),
                    }
                }
                let appender = tracing_appender::rolling::never(&dir, &name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                layers.push(format_layer(config.logging.file.format, writer, false));
                file_guard = Some(guard);
                run_log = Some(dir.join(name));
            }
            Err(err) => {
                setup_error = Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));

    let guard = TelemetryGuard {
        _file: file_guard,
        run_log,
    };
    if Registry::default().with(layers).try_init().is_err() {
        return guard;
    }

    if let Some(path) = guard.run_log.as_deref() {
        tracing::info!(path = %path.display(), pruned = pruned.len(), "run log opened");
    }
    if let Some(error) = setup_error {
        tracing::warn!("{error}");
    }
    guard
}

/// One layer in the configured format over any writer. Files get no ANSI.
fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(ansi)
                .with_targets(true)
                .with_writer(writer),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_ansi(ansi)
                .with_target(true)
                .with_writer(writer),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(ansi)
                .with_target(true)
                .with_writer(writer),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(writer),
        ),
    }
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::WARN,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

fn resolve_log_dir(config: &FileLoggingConfig) -> PathBuf {
    config.dir.clone().unwrap_or_else(paths::log_dir)
}

/// v7 ids sort by creation time, so file names order runs oldest first.
fn run_log_name(invocation: Uuid) -> String {
    format!("{RUN_LOG_PREFIX}{invocation}{RUN_LOG_SUFFIX}")
}

fn is_run_log(name: &str) -> bool {
    name.strip_prefix(RUN_LOG_PREFIX)
        .and_then(|rest| rest.strip_suffix(RUN_LOG_SUFFIX))
        .is_some_and(|id| Uuid::parse_str(id).is_ok())
}

/// Delete all but the newest `keep` run logs in `dir`, leaving room for the
/// one about to open. Returns the removed paths.
fn prune_run_logs(dir: &Path, keep: usize) -> std::io::Result<Vec<PathBuf>> {
    let mut runs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_str().is_some_and(is_run_log) && entry.file_type()?.is_file() {
            runs.push(entry.path());
        }
    }
    runs.sort();

    let excess = (runs.len() + 1).saturating_sub(keep.max(1));
    let mut removed = Vec::with_capacity(excess);
    for path in runs.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(removed)
}
