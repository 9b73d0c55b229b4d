//! Post-load checks against the target store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::Result;
use crate::model::{
    self, ANON, MIGRATION_STATUS, MigrationStatus, ModelSchema, OBJID, UNRESOLVED,
    instance_index_key, object_key,
};
use crate::snapshot::{CodecError, SnapshotReader};
use crate::store::{FieldMap, Store, StoreError, scan_keys};
use crate::transform::transformed_path;

use super::{CheckId, CheckStatus, Evidence, EvidenceCode, Phase, ReportBuilder, Severity, ValidationReport};

pub const DEFAULT_SAMPLE_SIZE: usize = 25;

/// Fields holding an objid; a natural key (email) here is a leaked v1 value.
const REFERENCE_FIELDS: &[&str] = &["owner_id", "org_id", "customer_objid", "organization_objid"];

type Objects = BTreeMap<&'static str, Vec<(String, FieldMap)>>;

/// Run every post-load check. `sources` names the transformed files whose
/// keys must all be present in `store`.
pub fn validate_post(
    store: &dyn Store,
    output: &Path,
    sources: &[&str],
    sample_size: usize,
) -> Result<ValidationReport> {
    let mut builder = ReportBuilder::new(Phase::Post, &CheckId::POST);
    loaded_objects(store, output, sources, &mut builder)?;

    let mut objects = Objects::new();
    for schema in model::v2_models() {
        let mut loaded = Vec::new();
        for key in scan_keys(store, &format!("{}:*:object", schema.name)) {
            let key = key?;
            match store.hgetall(&key) {
                Ok(fields) => loaded.push((key, fields)),
                Err(err) => {
                    builder.checked(CheckId::MigrationStatus, 1);
                    unreadable(&mut builder, CheckId::MigrationStatus, schema.name, &key, &err);
                }
            }
        }
        objects.insert(schema.name, loaded);
    }

    for schema in model::v2_models() {
        let loaded = &objects[schema.name];
        foreign_keys(store, schema, loaded, &mut builder);
        migration_status(schema, loaded, &mut builder);
        instance_index(store, schema, loaded, &mut builder);
        shape_rules(schema, loaded, sample_size, &mut builder);
    }
    cross_object(store, &objects, &mut builder);
    Ok(builder.finish())
}

/// A key the store could not read is a failed check, not a failed report.
fn unreadable(
    builder: &mut ReportBuilder,
    check: CheckId,
    model: &str,
    key: &str,
    err: &StoreError,
) {
    builder.record_issue(
        check,
        CheckStatus::Fail,
        Severity::High,
        Evidence::new(EvidenceCode::StoreError, format!("unreadable: {err}"))
            .model(model)
            .key(key),
        Some("inspect the key in the target store"),
    );
}

fn loaded_objects(
    store: &dyn Store,
    output: &Path,
    sources: &[&str],
    builder: &mut ReportBuilder,
) -> Result<()> {
    for source in sources {
        let path = transformed_path(output, source);
        if !path.exists() {
            continue;
        }
        for item in SnapshotReader::open(&path)? {
            let line = match item {
                Ok(line) => line,
                // Reported by the pre-load parse check.
                Err(CodecError::Parse { .. }) => continue,
                Err(err) => return Err(err.into()),
            };
            builder.checked(CheckId::LoadedObjects, 1);
            match store.exists(&line.record.key) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    unreadable(builder, CheckId::LoadedObjects, source, &line.record.key, &err);
                    continue;
                }
            }
            let (code, status, severity) = if line.record.ttl_ms.is_some() {
                (EvidenceCode::ObjectExpired, CheckStatus::Warn, Severity::Low)
            } else {
                (EvidenceCode::ObjectMissing, CheckStatus::Fail, Severity::Critical)
            };
            builder.record_issue(
                CheckId::LoadedObjects,
                status,
                severity,
                Evidence::new(code, "transformed key is absent from the store")
                    .model(*source)
                    .key(&line.record.key)
                    .line(line.line_no),
                Some("re-run `keyshift run --stage load`"),
            );
        }
    }
    Ok(())
}

fn foreign_keys(
    store: &dyn Store,
    schema: &ModelSchema,
    loaded: &[(String, FieldMap)],
    builder: &mut ReportBuilder,
) {
    for (key, fields) in loaded {
        for fk in schema.foreign_keys {
            let Some(value) = fields.get(fk.field) else {
                continue;
            };
            builder.checked(CheckId::ForeignKeys, 1);
            if value == ANON {
                continue;
            }
            if value == UNRESOLVED {
                builder.record_issue(
                    CheckId::ForeignKeys,
                    CheckStatus::Warn,
                    Severity::Medium,
                    Evidence::new(
                        EvidenceCode::PlaceholderReference,
                        format!("{} reference was never resolved", fk.target),
                    )
                    .model(schema.name)
                    .key(key)
                    .field(fk.field),
                    Some("check the lookup_miss errors recorded by the transform stage"),
                );
                continue;
            }
            let target = object_key(fk.target, value);
            let exists = match store.exists(&target) {
                Ok(exists) => exists,
                Err(err) => {
                    unreadable(builder, CheckId::ForeignKeys, fk.target, &target, &err);
                    continue;
                }
            };
            if !exists {
                builder.record_issue(
                    CheckId::ForeignKeys,
                    CheckStatus::Fail,
                    Severity::High,
                    Evidence::new(
                        EvidenceCode::DanglingReference,
                        format!("{} `{value}` does not exist", fk.target),
                    )
                    .model(schema.name)
                    .key(key)
                    .field(fk.field),
                    Some("reload the referenced model before its dependents"),
                );
            }
        }
    }
}

fn migration_status(schema: &ModelSchema, loaded: &[(String, FieldMap)], builder: &mut ReportBuilder) {
    builder.checked(CheckId::MigrationStatus, loaded.len() as u64);
    let completed = MigrationStatus::Completed.as_str();
    for (key, fields) in loaded {
        let status = fields.get(MIGRATION_STATUS).map(String::as_str).unwrap_or_default();
        if status != completed {
            builder.record_issue(
                CheckId::MigrationStatus,
                CheckStatus::Fail,
                Severity::High,
                Evidence::new(
                    EvidenceCode::StatusMismatch,
                    format!("migration_status is `{status}`, expected `{completed}`"),
                )
                .model(schema.name)
                .key(key)
                .field(MIGRATION_STATUS),
                None,
            );
        }
    }
}

fn instance_index(
    store: &dyn Store,
    schema: &ModelSchema,
    loaded: &[(String, FieldMap)],
    builder: &mut ReportBuilder,
) {
    let index_key = instance_index_key(schema.name);
    let members: BTreeSet<String> = match store.zrange_with_scores(&index_key) {
        Ok(members) => members.into_iter().map(|(member, _)| member).collect(),
        Err(err) => {
            builder.checked(CheckId::InstanceIndex, loaded.len() as u64);
            unreadable(builder, CheckId::InstanceIndex, schema.name, &index_key, &err);
            return;
        }
    };
    let objids: BTreeSet<String> = loaded
        .iter()
        .filter_map(|(_, fields)| fields.get(OBJID).cloned())
        .collect();
    builder.checked(CheckId::InstanceIndex, loaded.len() as u64);
    const REBUILD: &str = "re-run `keyshift run --stage rebuild_index`";
    if members.len() != loaded.len() {
        builder.record_issue(
            CheckId::InstanceIndex,
            CheckStatus::Fail,
            Severity::High,
            Evidence::new(
                EvidenceCode::IndexCardinality,
                format!("{} member(s) for {} object(s)", members.len(), loaded.len()),
            )
            .model(schema.name)
            .key(&index_key),
            Some(REBUILD),
        );
    }
    for missing in objids.difference(&members) {
        builder.record_issue(
            CheckId::InstanceIndex,
            CheckStatus::Fail,
            Severity::Medium,
            Evidence::new(EvidenceCode::IndexMember, format!("`{missing}` is not indexed"))
                .model(schema.name)
                .key(&index_key),
            Some(REBUILD),
        );
    }
}

/// Evenly spaced, deterministic sample.
fn sample<T>(items: &[T], size: usize) -> impl Iterator<Item = &T> {
    let step = if size == 0 {
        usize::MAX
    } else {
        items.len().div_ceil(size).max(1)
    };
    items.iter().step_by(step).take(size)
}

fn shape_rules(
    schema: &ModelSchema,
    loaded: &[(String, FieldMap)],
    sample_size: usize,
    builder: &mut ReportBuilder,
) {
    for (key, fields) in sample(loaded, sample_size) {
        builder.checked(CheckId::ShapeRules, 1);
        let mut violation = |field: &str, message: String| {
            builder.record_issue(
                CheckId::ShapeRules,
                CheckStatus::Fail,
                Severity::High,
                Evidence::new(EvidenceCode::ShapeViolation, message)
                    .model(schema.name)
                    .key(key)
                    .field(field),
                Some("fix the field plan; v1 fields must not survive"),
            );
        };
        if schema.name == model::CUSTOMER.name && fields.contains_key("custid") {
            violation("custid", "customer still carries v1 `custid`".into());
        }
        if schema.name == model::RECEIPT.name {
            for legacy in ["viewed", "received"] {
                if fields.contains_key(legacy) {
                    violation(legacy, format!("receipt still carries v1 `{legacy}`"));
                }
            }
        }
        for field in REFERENCE_FIELDS {
            if let Some(value) = fields.get(*field).filter(|value| value.contains('@')) {
                violation(*field, format!("`{field}` holds a natural key `{value}`"));
            }
        }
    }
}

/// Receipts protected by a passphrase should point at a protected secret.
/// The v1 data is known to disagree here, so this only warns.
fn cross_object(store: &dyn Store, objects: &Objects, builder: &mut ReportBuilder) {
    let Some(receipts) = objects.get(model::RECEIPT.name) else {
        return;
    };
    for (key, fields) in receipts {
        let has_passphrase = fields.get("passphrase").is_some_and(|p| !p.is_empty());
        let Some(secret_id) = fields
            .get("secret_id")
            .filter(|id| has_passphrase && !id.is_empty() && id.as_str() != ANON)
        else {
            continue;
        };
        builder.checked(CheckId::CrossObject, 1);
        let secret_key = object_key(model::SECRET.name, secret_id);
        // A missing secret is reported by the foreign key check.
        let passphrase = match store.hget(&secret_key, "passphrase") {
            Ok(passphrase) => passphrase,
            Err(err) => {
                unreadable(builder, CheckId::CrossObject, model::SECRET.name, &secret_key, &err);
                continue;
            }
        };
        let secret_exists = match store.exists(&secret_key) {
            Ok(exists) => exists,
            Err(err) => {
                unreadable(builder, CheckId::CrossObject, model::SECRET.name, &secret_key, &err);
                continue;
            }
        };
        if secret_exists && passphrase.is_none_or(|p| p.is_empty()) {
            builder.record_issue(
                CheckId::CrossObject,
                CheckStatus::Warn,
                Severity::Low,
                Evidence::new(
                    EvidenceCode::PassphraseMismatch,
                    format!("receipt has a passphrase but secret `{secret_id}` does not"),
                )
                .model(model::RECEIPT.name)
                .key(key)
                .field("passphrase"),
                None,
            );
        }
    }
}
