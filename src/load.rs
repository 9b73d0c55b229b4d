//! Load stage: write transformed snapshot files into the target store.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use crate::model;
use crate::pipeline::{ErrorClass, ErrorEntry, StageLog};
use crate::snapshot::{CodecError, Record, RecordValue, SnapshotReader};
use crate::store::{DumpBlob, Store, StoreError, StoredValue};
use crate::transform::transformed_path;

/// What to do when a key already exists in the target store.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// Overwrite the key in one write.
    #[default]
    Replace,
    /// Leave the existing key alone.
    Skip,
}

impl LoadPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadPolicy::Replace => "replace",
            LoadPolicy::Skip => "skip",
        }
    }
}

impl std::str::FromStr for LoadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(LoadPolicy::Replace),
            "skip" => Ok(LoadPolicy::Skip),
            other => Err(format!("unknown load policy `{other}`")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoadOptions {
    pub output: PathBuf,
    pub policy: LoadPolicy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub written: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Load `transformed/{source}.jsonl` for each source, in order.
///
/// A failed write is logged and counted; the scan continues. Only an
/// unreadable transformed file aborts.
pub fn load_transformed(
    store: &dyn Store,
    sources: &[&str],
    options: &LoadOptions,
    log: &mut StageLog,
) -> Result<LoadSummary, CodecError> {
    load_into(store, None, sources, options, log)
}

/// Dry-run load: `target` is only read, every write goes to `shadow`.
///
/// Keys the skip policy leaves alone are copied from `target`, so `shadow`
/// ends up holding what the target would hold for every migrated key.
pub fn load_shadow(
    target: &dyn Store,
    shadow: &dyn Store,
    sources: &[&str],
    options: &LoadOptions,
    log: &mut StageLog,
) -> Result<LoadSummary, CodecError> {
    load_into(target, Some(shadow), sources, options, log)
}

fn load_into(
    target: &dyn Store,
    shadow: Option<&dyn Store>,
    sources: &[&str],
    options: &LoadOptions,
    log: &mut StageLog,
) -> Result<LoadSummary, CodecError> {
    let dry_run = shadow.is_some();
    let writes = shadow.unwrap_or(target);
    let mut summary = LoadSummary::default();
    for source in sources {
        let path = transformed_path(&options.output, source);
        let _span = info_span!("load", source = *source).entered();
        if !path.exists() {
            debug!(path = %path.display(), "no transformed file");
            continue;
        }
        for item in SnapshotReader::open(&path)? {
            let line = match item {
                Ok(line) => line,
                Err(CodecError::Parse {
                    line_no, reason, ..
                }) => {
                    log.error(
                        ErrorEntry::new(ErrorClass::Parse, reason)
                            .model(*source)
                            .line(line_no),
                    );
                    summary.failed += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let record = &line.record;
            if options.policy == LoadPolicy::Skip {
                match target.exists(&record.key) {
                    Ok(true) => {
                        summary.skipped += 1;
                        log.bump("load.skipped");
                        if let Some(shadow) = shadow
                            && let Err(err) = carry_over(target, shadow, &record.key)
                        {
                            store_failure(log, source, record, line.line_no, &err);
                            summary.failed += 1;
                        }
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        store_failure(log, source, &line.record, line.line_no, &err);
                        summary.failed += 1;
                        continue;
                    }
                }
            }
            match write_record(writes, record, options.policy) {
                Ok(()) => {
                    summary.written += 1;
                    log.bump(if dry_run { "load.would_write" } else { "load.written" });
                    log.bump(&format!("{}.loaded", record.key_parts().prefix));
                }
                Err(WriteError::Store(err)) => {
                    store_failure(log, source, record, line.line_no, &err);
                    summary.failed += 1;
                }
                Err(WriteError::Coerce(field, err)) => {
                    log.error(
                        ErrorEntry::new(ErrorClass::Coerce, format!("field `{field}`: {err}"))
                            .model(*source)
                            .key(&record.key)
                            .line(line.line_no),
                    );
                    summary.failed += 1;
                }
            }
        }
    }
    log.add("load.failed", summary.failed);
    info!(
        written = summary.written,
        skipped = summary.skipped,
        failed = summary.failed,
        dry_run,
        "load finished"
    );
    Ok(summary)
}

enum WriteError {
    Store(StoreError),
    Coerce(String, model::CoerceError),
}

impl From<StoreError> for WriteError {
    fn from(err: StoreError) -> Self {
        WriteError::Store(err)
    }
}

/// Each record lands with a single `restore`, value and ttl together, so a
/// failed write leaves nothing behind.
fn write_record(store: &dyn Store, record: &Record, policy: LoadPolicy) -> Result<(), WriteError> {
    let replace = policy == LoadPolicy::Replace;
    match &record.value {
        RecordValue::Dump(blob) => {
            store.restore(&record.key, record.ttl_ms, blob, replace)?;
        }
        RecordValue::Fields(fields) => {
            let fields = match model::schema(record.key_parts().prefix) {
                Some(schema) => schema
                    .normalize(fields)
                    .map_err(|(field, err)| WriteError::Coerce(field, err))?,
                None => fields.clone(),
            };
            let blob = DumpBlob::encode(&StoredValue::Hash(fields)).map_err(StoreError::from)?;
            store.restore(&record.key, record.ttl_ms, &blob, replace)?;
        }
    }
    Ok(())
}

fn carry_over(from: &dyn Store, to: &dyn Store, key: &str) -> Result<(), StoreError> {
    if let Some(blob) = from.dump(key)? {
        to.restore(key, from.pttl(key)?, &blob, true)?;
    }
    Ok(())
}

fn store_failure(log: &mut StageLog, source: &str, record: &Record, line: usize, err: &StoreError) {
    log.error(
        ErrorEntry::new(ErrorClass::Store, err.to_string())
            .model(source)
            .key(&record.key)
            .line(line),
    );
}
