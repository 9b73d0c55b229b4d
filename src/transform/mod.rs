//! Transform engine.
//!
//! One [`Router`] per source model decides, line by line, whether a record is
//! dropped, passed through unchanged, or rewritten into v2 records. Routers
//! are grouped into phases by [`PhasePlan`]; a phase's routers run on scoped
//! worker threads and join before the next phase may read what they
//! published.

mod customer;
mod custom_domain;
mod fields;
mod mapping;
mod plan;
mod receipt;
mod secret;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info_span;

use crate::ident::{ExternalId, PrimaryId, SourceTime};
use crate::inspect::{InspectError, Inspector, ScratchNamespace};
use crate::model::{
    self, ANON, CREATED, CoerceError, EXTID, FieldType, MIGRATED_AT, MIGRATION_STATUS,
    MigrationStatus, ModelSchema, OBJID, ORIGINAL_RECORD, UNRESOLVED, V1_KEY, render_timestamp,
};
use crate::pipeline::{ErrorClass, ErrorEntry, PipelineError, StageLog};
use crate::snapshot::{
    CodecError, Record, RecordValue, SnapshotLine, SnapshotReader, SnapshotWriter, snapshot_path,
};
use crate::store::{FieldMap, Store};
use crate::{Error, Result};

pub use customer::CustomerRouter;
pub use custom_domain::CustomDomainRouter;
pub use fields::{FieldAction, FieldPlan, ValueTable};
pub use mapping::{MAPPINGS_FILE, MappingConflict, MappingDelta, MappingKind, MappingTables};
pub use plan::{PhasePlan, PlanError};
pub use receipt::ReceiptRouter;
pub use secret::SecretRouter;

pub const TRANSFORMED_DIR: &str = "transformed";
pub const REJECTED_DIR: &str = "rejected";

/// Per-record transform failure. The record is abandoned before anything
/// is written and its source line goes to `rejected/`.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to materialize value: {0}")]
    Materialize(#[from] InspectError),
    #[error("field `{field}` is not declared for {model}")]
    UnknownField { model: String, field: String },
    #[error("value `{value}` of `{field}` has no entry in {table}")]
    UnmappedValue {
        table: &'static str,
        field: String,
        value: String,
    },
    #[error("field `{field}`: {source}")]
    Coerce {
        field: String,
        #[source]
        source: CoerceError,
    },
    #[error("mapping table {kind} read before it was sealed")]
    UnsealedTable { kind: MappingKind },
    #[error("{0}")]
    Invalid(String),
}

impl TransformError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransformError::Materialize(_) => ErrorClass::Materialize,
            TransformError::UnknownField { .. } => ErrorClass::UnknownField,
            TransformError::UnmappedValue { .. } => ErrorClass::UnmappedValue,
            TransformError::Coerce { .. } => ErrorClass::Coerce,
            TransformError::UnsealedTable { .. } | TransformError::Invalid(_) => {
                ErrorClass::Invariant
            }
        }
    }
}

/// What a router decided for one line.
#[derive(Debug)]
pub enum Routed {
    Drop,
    /// Keep the source line byte-for-byte.
    Passthrough,
    Rewrite(Vec<Record>),
}

pub trait Router: Send + Sync {
    /// v1 key prefix and snapshot file stem.
    fn source(&self) -> &'static str;

    fn consumes(&self) -> &'static [MappingKind] {
        &[]
    }

    fn produces(&self) -> &'static [MappingKind] {
        &[]
    }

    fn plans(&self) -> &'static [&'static FieldPlan];

    /// Fields the router fills in itself, per target model.
    fn derived(&self) -> &'static [(&'static ModelSchema, &'static [&'static str])];

    fn route(&self, line: &SnapshotLine, ctx: &mut RouteContext<'_>)
    -> Result<Routed, TransformError>;
}

/// Worker-local state handed to [`Router::route`].
pub struct RouteContext<'a> {
    source: &'static str,
    inspector: Inspector<'a>,
    tables: &'a MappingTables,
    delta: MappingDelta,
    log: StageLog,
    migrated_at: SourceTime,
    fallback_created: SourceTime,
}

impl<'a> RouteContext<'a> {
    pub fn new(
        source: &'static str,
        inspector: Inspector<'a>,
        tables: &'a MappingTables,
        log: StageLog,
        migrated_at: SourceTime,
    ) -> Self {
        Self {
            source,
            inspector,
            tables,
            delta: MappingDelta::default(),
            log,
            migrated_at,
            fallback_created: migrated_at,
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn bump(&mut self, counter: &str) {
        self.log.bump(counter);
    }

    pub fn log(&self) -> &StageLog {
        &self.log
    }

    /// Field map of a hash record, whichever form it arrived in.
    pub fn materialize(&self, line: &SnapshotLine) -> Result<FieldMap, TransformError> {
        match &line.record.value {
            RecordValue::Fields(fields) => Ok(fields.clone()),
            RecordValue::Dump(blob) => Ok(self.inspector.inspect(blob)?),
        }
    }

    pub fn lookup(&self, kind: MappingKind, key: &str) -> Result<Option<String>, TransformError> {
        Ok(self.tables.lookup(kind, key)?.map(str::to_string))
    }

    pub fn publish(&mut self, kind: MappingKind, key: &str, id: &str) {
        if let Err(conflict) = self.delta.publish(kind, key, id) {
            self.log.error(
                ErrorEntry::new(ErrorClass::Invariant, conflict.to_string())
                    .model(self.source)
                    .key(key),
            );
        }
    }

    /// Resolve a natural owner key through `kind`.
    ///
    /// Absent or `anon` owners become [`ANON`] and are never looked up. A
    /// present owner without a mapping becomes [`UNRESOLVED`], bumps the
    /// model's `missing_mappings` counter and records a lookup miss.
    pub fn resolve_owner(
        &mut self,
        kind: MappingKind,
        model: &str,
        line: &SnapshotLine,
        natural: Option<&str>,
    ) -> Result<String, TransformError> {
        let natural = natural.map(str::trim).unwrap_or_default();
        if natural.is_empty() || natural == ANON {
            self.log.bump(&format!("{model}.anonymous"));
            return Ok(ANON.to_string());
        }
        self.resolve_present(kind, model, line, natural)
    }

    /// Resolve an optional link to another object through `kind`.
    ///
    /// Only an absent or blank key means "no link". Every other value is
    /// looked up, and a miss becomes [`UNRESOLVED`] as for owners.
    pub fn resolve_link(
        &mut self,
        kind: MappingKind,
        model: &str,
        line: &SnapshotLine,
        natural: Option<&str>,
    ) -> Result<Option<String>, TransformError> {
        match natural.map(str::trim).filter(|key| !key.is_empty()) {
            Some(natural) => self.resolve_present(kind, model, line, natural).map(Some),
            None => Ok(None),
        }
    }

    fn resolve_present(
        &mut self,
        kind: MappingKind,
        model: &str,
        line: &SnapshotLine,
        natural: &str,
    ) -> Result<String, TransformError> {
        match self.lookup(kind, natural)? {
            Some(id) => Ok(id),
            None => {
                self.log.bump(&format!("{model}.missing_mappings"));
                self.log.error(
                    ErrorEntry::new(
                        ErrorClass::LookupMiss,
                        format!("no {kind} entry for `{natural}`"),
                    )
                    .model(model)
                    .key(&line.record.key)
                    .line(line.line_no),
                );
                Ok(UNRESOLVED.to_string())
            }
        }
    }

    /// Source creation time: `created`, else `updated`, else the run start.
    pub fn created(&mut self, model: &str, fields: &FieldMap) -> Result<SourceTime, TransformError> {
        for field in ["created", "updated"] {
            if let Some(raw) = fields.get(field).filter(|raw| !raw.trim().is_empty()) {
                return SourceTime::parse(raw).map_err(|err| TransformError::Coerce {
                    field: field.to_string(),
                    source: CoerceError {
                        value: raw.clone(),
                        expected: FieldType::Timestamp,
                        reason: err.to_string(),
                    },
                });
            }
        }
        self.log.bump(&format!("{model}.created_fallback"));
        Ok(self.fallback_created)
    }

    /// Back-reference, status and (for rewritten objects) the verbatim line.
    pub fn stamp(&self, schema: &ModelSchema, line: &SnapshotLine, out: &mut FieldMap) {
        out.insert(V1_KEY.into(), line.record.key.clone());
        out.insert(
            MIGRATION_STATUS.into(),
            MigrationStatus::Completed.as_str().into(),
        );
        out.insert(MIGRATED_AT.into(), self.migrated_at.secs().to_string());
        if schema.carries_original {
            out.insert(ORIGINAL_RECORD.into(), line.raw.clone());
        }
    }

    fn into_parts(self) -> (MappingDelta, StageLog) {
        (self.delta, self.log)
    }
}

/// Allocate `objid` (and `extid` when the model has one) from the source
/// creation time and write them with the normalized `created`.
pub(crate) fn assign_identity(
    schema: &ModelSchema,
    created: SourceTime,
    out: &mut FieldMap,
) -> String {
    let primary = PrimaryId::from_source_time(created);
    if let Some(prefix) = schema.ext_prefix {
        out.insert(EXTID.into(), ExternalId::derive(&primary, prefix).to_string());
    }
    let objid = primary.to_string();
    out.insert(OBJID.into(), objid.clone());
    out.insert(CREATED.into(), render_timestamp(created));
    objid
}

/// Build the v2 object record, refusing undeclared fields.
pub(crate) fn object_record(
    schema: &ModelSchema,
    fields: FieldMap,
    ttl_ms: Option<u64>,
) -> Result<Record, TransformError> {
    if let Some(field) = schema.undeclared(&fields).first() {
        return Err(TransformError::UnknownField {
            model: schema.name.to_string(),
            field: field.to_string(),
        });
    }
    let objid = fields
        .get(OBJID)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| TransformError::Invalid(format!("{} object without objid", schema.name)))?;
    let mut record = Record::generated(model::object_key(schema.name, objid), fields);
    record.ttl_ms = ttl_ms;
    Ok(record)
}

#[derive(Clone, Debug)]
pub struct TransformOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub scratch_prefix: String,
    pub max_errors: usize,
}

#[derive(Debug)]
pub struct TransformOutcome {
    pub log: StageLog,
    pub tables: MappingTables,
}

/// Run every phase of `plan` over `{input}/{source}.jsonl`, writing
/// `transformed/`, `rejected/` and `mappings.json` under the output dir.
///
/// Only fatal problems (unreadable input, unwritable output, a panicked
/// worker) return `Err`; per-record failures land in the returned log.
pub fn run_transform(
    plan: &PhasePlan,
    scratch: &dyn Store,
    options: &TransformOptions,
) -> Result<TransformOutcome> {
    if !options.input.is_dir() {
        return Err(PipelineError::MissingInput {
            path: options.input.clone(),
        }
        .into());
    }
    let migrated_at = SourceTime::from_millis(crate::store::now_ms())
        .map_err(|err| Error::Pipeline(PipelineError::Clock(err.to_string())))?;
    let mut log = StageLog::new(options.max_errors);
    let mut tables = MappingTables::new();

    for (index, phase) in plan.phases().iter().enumerate() {
        let span = info_span!("phase", index, routers = phase.len());
        let _guard = span.enter();
        let results = std::thread::scope(|scope| {
            let handles: Vec<_> = phase
                .iter()
                .map(|router| {
                    let tables = &tables;
                    let span = span.clone();
                    scope.spawn(move || {
                        let _guard = span.enter();
                        run_router(router.as_ref(), tables, scratch, options, migrated_at)
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(phase.iter())
                .map(|(handle, router)| {
                    handle.join().map_err(|_| PipelineError::WorkerPanicked {
                        model: router.source().to_string(),
                    })
                })
                .collect::<Vec<_>>()
        });

        for result in results {
            let (delta, worker_log) = result??;
            log.absorb(worker_log);
            for conflict in tables.merge(delta) {
                log.error(ErrorEntry::new(ErrorClass::Invariant, conflict.to_string()));
            }
        }
        tables.seal(phase.iter().flat_map(|router| router.produces().iter().copied()));
        tracing::info!(phase = index, sizes = ?tables.sizes(), "phase joined");
    }

    let mappings = options.output.join(MAPPINGS_FILE);
    tables
        .write_json(&mappings)
        .map_err(|source| PipelineError::Io {
            path: mappings,
            source,
        })?;
    Ok(TransformOutcome { log, tables })
}

fn run_router(
    router: &dyn Router,
    tables: &MappingTables,
    scratch: &dyn Store,
    options: &TransformOptions,
    migrated_at: SourceTime,
) -> Result<(MappingDelta, StageLog)> {
    let source = router.source();
    let _span = info_span!("router", source).entered();
    let namespace = ScratchNamespace::new(
        options.scratch_prefix.clone(),
        format!("{source}.{}", std::process::id()),
    );
    let mut ctx = RouteContext::new(
        source,
        Inspector::new(scratch, namespace),
        tables,
        StageLog::new(options.max_errors),
        migrated_at,
    );
    let mut transformed =
        SnapshotWriter::create(&snapshot_path(&options.output.join(TRANSFORMED_DIR), source))?;
    let mut rejected =
        SnapshotWriter::create(&snapshot_path(&options.output.join(REJECTED_DIR), source))?;

    let input = snapshot_path(&options.input, source);
    if input.exists() {
        for item in SnapshotReader::open(&input)? {
            route_one(router, item, &mut ctx, &mut transformed, &mut rejected)?;
        }
    } else {
        tracing::info!(path = %input.display(), "no snapshot for source; nothing to transform");
    }

    let written = transformed.finish()?;
    let rejected_lines = rejected.finish()?;
    tracing::info!(written, rejected = rejected_lines, "router finished");
    Ok(ctx.into_parts())
}

fn route_one(
    router: &dyn Router,
    item: std::result::Result<SnapshotLine, CodecError>,
    ctx: &mut RouteContext<'_>,
    transformed: &mut SnapshotWriter,
    rejected: &mut SnapshotWriter,
) -> Result<()> {
    let source = router.source();
    ctx.bump(&format!("{source}.read"));
    let line = match item {
        Ok(line) => line,
        Err(CodecError::Parse {
            line_no,
            reason,
            raw,
        }) => {
            ctx.log.error(
                ErrorEntry::new(ErrorClass::Parse, reason)
                    .model(source)
                    .line(line_no),
            );
            rejected.write_raw(&raw)?;
            ctx.bump(&format!("{source}.rejected"));
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    match router.route(&line, ctx) {
        Ok(Routed::Drop) => ctx.bump(&format!("{source}.dropped")),
        Ok(Routed::Passthrough) => {
            transformed.write_raw(&line.raw)?;
            ctx.bump(&format!("{source}.passthrough"));
        }
        Ok(Routed::Rewrite(records)) => {
            for record in &records {
                transformed.write(record)?;
                let model = record.key_parts().prefix;
                ctx.bump(&format!("{model}.written"));
            }
            ctx.bump(&format!("{source}.rewritten"));
        }
        Err(err) => {
            ctx.log.error(
                ErrorEntry::new(err.class(), err.to_string())
                    .model(source)
                    .key(&line.record.key)
                    .line(line.line_no),
            );
            rejected.write_raw(&line.raw)?;
            ctx.bump(&format!("{source}.rejected"));
        }
    }
    Ok(())
}

/// Transformed snapshot path for `source` under an output directory.
pub fn transformed_path(output: &Path, source: &str) -> PathBuf {
    snapshot_path(&output.join(TRANSFORMED_DIR), source)
}

/// Rejected-lines path for `source` under an output directory.
pub fn rejected_path(output: &Path, source: &str) -> PathBuf {
    snapshot_path(&output.join(REJECTED_DIR), source)
}
