//! Pre-load checks over the transformed snapshot files.

use std::collections::BTreeMap;
use std::path::Path;

use crate::model::{self, ORIGINAL_RECORD, V1_KEY};
use crate::snapshot::{CodecError, Record, SnapshotReader};
use crate::transform::{rejected_path, transformed_path};

use super::{CheckId, CheckStatus, Evidence, EvidenceCode, Phase, ReportBuilder, Severity, ValidationReport};

const RERUN_TRANSFORM: &str = "fix the transform plan and re-run `keyshift run --stage transform`";

/// Run every pre-load check against `{output}/transformed/`.
pub fn validate_pre(output: &Path, sources: &[&str]) -> Result<ValidationReport, CodecError> {
    let mut builder = ReportBuilder::new(Phase::Pre, &CheckId::PRE);
    let mut objects: BTreeMap<&'static str, u64> = BTreeMap::new();

    for source in sources {
        rejected_lines(output, source, &mut builder)?;

        let path = transformed_path(output, source);
        if !path.exists() {
            continue;
        }
        for item in SnapshotReader::open(&path)? {
            builder.checked(CheckId::SnapshotParse, 1);
            let line = match item {
                Ok(line) => line,
                Err(CodecError::Parse {
                    line_no, reason, ..
                }) => {
                    builder.record_issue(
                        CheckId::SnapshotParse,
                        CheckStatus::Fail,
                        Severity::High,
                        Evidence::new(EvidenceCode::ParseFailed, reason)
                            .model(*source)
                            .line(line_no),
                        Some(RERUN_TRANSFORM),
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            if let Some(model) = check_object(&line.record, line.line_no, &mut builder) {
                *objects.entry(model).or_default() += 1;
            }
        }
    }

    dependent_cardinality(&objects, &mut builder);
    Ok(builder.finish())
}

/// Rejected lines are preserved, not lost, but an operator should see them.
fn rejected_lines(output: &Path, source: &str, builder: &mut ReportBuilder) -> Result<(), CodecError> {
    let path = rejected_path(output, source);
    if !path.exists() {
        return Ok(());
    }
    let count = std::fs::read_to_string(&path)
        .map_err(|source| CodecError::Io {
            path: path.clone(),
            source,
        })?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count();
    if count > 0 {
        builder.record_issue(
            CheckId::SnapshotParse,
            CheckStatus::Warn,
            Severity::Medium,
            Evidence::new(
                EvidenceCode::RejectedLines,
                format!("{count} line(s) preserved in {}", path.display()),
            )
            .model(source),
            Some("inspect rejected/ and the transform errors in manifest.json"),
        );
    }
    Ok(())
}

/// Structural checks for one generated v2 object. Returns its model when it
/// is one.
fn check_object(record: &Record, line_no: usize, builder: &mut ReportBuilder) -> Option<&'static str> {
    let fields = record.fields()?;
    let parts = record.key_parts();
    if parts.suffix != "object" {
        return None;
    }
    let schema = model::schema(parts.prefix)?;

    builder.checked(CheckId::RequiredFields, 1);
    for field in schema.missing_required(fields) {
        builder.record_issue(
            CheckId::RequiredFields,
            CheckStatus::Fail,
            Severity::High,
            Evidence::new(EvidenceCode::MissingRequired, format!("`{field}` is missing or empty"))
                .model(schema.name)
                .key(&record.key)
                .field(field)
                .line(line_no),
            Some(RERUN_TRANSFORM),
        );
    }

    builder.checked(CheckId::DeclaredFields, 1);
    for field in schema.undeclared(fields) {
        builder.record_issue(
            CheckId::DeclaredFields,
            CheckStatus::Fail,
            Severity::Critical,
            Evidence::new(
                EvidenceCode::UndeclaredField,
                format!("`{field}` is not declared for {}", schema.name),
            )
            .model(schema.name)
            .key(&record.key)
            .field(field)
            .line(line_no),
            Some("declare the field in the model table or drop it in the field plan"),
        );
    }

    if schema.carries_original {
        builder.checked(CheckId::OriginalRecord, 1);
        let v1_key = fields.get(V1_KEY).map(String::as_str).unwrap_or_default();
        match fields.get(ORIGINAL_RECORD).filter(|raw| !raw.is_empty()) {
            None => builder.record_issue(
                CheckId::OriginalRecord,
                CheckStatus::Fail,
                Severity::Critical,
                Evidence::new(EvidenceCode::MissingOriginal, "rewritten object lost its source line")
                    .model(schema.name)
                    .key(&record.key)
                    .line(line_no),
                Some(RERUN_TRANSFORM),
            ),
            Some(raw) => match Record::from_line(line_no, raw) {
                Ok(original) if original.key == v1_key => {}
                Ok(original) => builder.record_issue(
                    CheckId::OriginalRecord,
                    CheckStatus::Fail,
                    Severity::High,
                    Evidence::new(
                        EvidenceCode::OriginalMismatch,
                        format!("original line is for `{}`, v1_key is `{v1_key}`", original.key),
                    )
                    .model(schema.name)
                    .key(&record.key)
                    .line(line_no),
                    Some(RERUN_TRANSFORM),
                ),
                Err(err) => builder.record_issue(
                    CheckId::OriginalRecord,
                    CheckStatus::Fail,
                    Severity::High,
                    Evidence::new(EvidenceCode::OriginalMismatch, err.to_string())
                        .model(schema.name)
                        .key(&record.key)
                        .line(line_no),
                    Some(RERUN_TRANSFORM),
                ),
            },
        }
    }
    Some(schema.name)
}

/// One organization and one membership per customer.
fn dependent_cardinality(objects: &BTreeMap<&'static str, u64>, builder: &mut ReportBuilder) {
    let count = |model: &str| objects.get(model).copied().unwrap_or(0);
    let customers = count(model::CUSTOMER.name);
    builder.checked(CheckId::DependentCardinality, customers);
    for dependent in [model::ORGANIZATION.name, model::ORG_MEMBERSHIP.name] {
        let found = count(dependent);
        if found != customers {
            builder.record_issue(
                CheckId::DependentCardinality,
                CheckStatus::Fail,
                Severity::High,
                Evidence::new(
                    EvidenceCode::CardinalityMismatch,
                    format!("{customers} customer(s) but {found} {dependent}(s)"),
                )
                .model(dependent),
                Some(RERUN_TRANSFORM),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotWriter;
    use crate::store::FieldMap;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn write(dir: &Path, source: &str, lines: &[String]) {
        let mut writer = SnapshotWriter::create(&transformed_path(dir, source)).expect("create");
        for line in lines {
            writer.write_raw(line).expect("write");
        }
        writer.finish().expect("finish");
    }

    fn membership(id: &str) -> String {
        Record::generated(
            format!("org_membership:{id}:object"),
            fields(&[
                ("objid", id),
                ("organization_objid", "o1"),
                ("customer_objid", "c1"),
                ("role", "owner"),
                ("status", "active"),
                ("created", "1"),
                ("v1_key", "customer:a:object"),
                ("migration_status", "completed"),
                ("migrated_at", "2"),
            ]),
        )
        .to_line()
        .expect("line")
    }

    #[test]
    fn structural_leak_and_cardinality_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let leaked = Record::generated(
            "secret:s1:object",
            fields(&[("objid", "s1"), ("custid", "bob@example.com")]),
        )
        .to_line()
        .expect("line");
        write(dir.path(), "secret", &[leaked, "{torn".into()]);
        write(dir.path(), "customer", &[membership("m1")]);

        let report = validate_pre(dir.path(), &["customer", "secret"]).expect("validate");
        assert!(!report.passed());
        let declared = report.check(CheckId::DeclaredFields).expect("declared");
        assert_eq!(declared.status, CheckStatus::Fail);
        assert_eq!(declared.evidence[0].field.as_deref(), Some("custid"));
        assert_eq!(
            report.check(CheckId::SnapshotParse).expect("parse").status,
            CheckStatus::Fail
        );
        assert_eq!(
            report.check(CheckId::DependentCardinality).expect("card").status,
            CheckStatus::Fail
        );
        let original = report.check(CheckId::OriginalRecord).expect("original");
        assert_eq!(original.status, CheckStatus::Fail);
    }

    #[test]
    fn empty_output_passes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = validate_pre(dir.path(), &["customer"]).expect("validate");
        assert!(report.passed());
        assert_eq!(report.checks.len(), CheckId::PRE.len());
    }
}
