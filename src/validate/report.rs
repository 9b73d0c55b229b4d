//! Check report shared by pre- and post-load validation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pipeline::now_rfc3339;

/// Evidence entries kept per check. `issues` carries the full count.
pub const EVIDENCE_LIMIT: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckId {
    SnapshotParse,
    RequiredFields,
    DeclaredFields,
    OriginalRecord,
    DependentCardinality,
    LoadedObjects,
    ForeignKeys,
    MigrationStatus,
    InstanceIndex,
    ShapeRules,
    CrossObject,
}

impl CheckId {
    pub const PRE: [CheckId; 5] = [
        CheckId::SnapshotParse,
        CheckId::RequiredFields,
        CheckId::DeclaredFields,
        CheckId::OriginalRecord,
        CheckId::DependentCardinality,
    ];

    pub const POST: [CheckId; 6] = [
        CheckId::LoadedObjects,
        CheckId::ForeignKeys,
        CheckId::MigrationStatus,
        CheckId::InstanceIndex,
        CheckId::ShapeRules,
        CheckId::CrossObject,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CheckId::SnapshotParse => "snapshot_parse",
            CheckId::RequiredFields => "required_fields",
            CheckId::DeclaredFields => "declared_fields",
            CheckId::OriginalRecord => "original_record",
            CheckId::DependentCardinality => "dependent_cardinality",
            CheckId::LoadedObjects => "loaded_objects",
            CheckId::ForeignKeys => "foreign_keys",
            CheckId::MigrationStatus => "migration_status",
            CheckId::InstanceIndex => "instance_index",
            CheckId::ShapeRules => "shape_rules",
            CheckId::CrossObject => "cross_object",
        }
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceCode {
    ParseFailed,
    RejectedLines,
    MissingRequired,
    UndeclaredField,
    MissingOriginal,
    OriginalMismatch,
    CardinalityMismatch,
    ObjectMissing,
    ObjectExpired,
    PlaceholderReference,
    DanglingReference,
    StatusMismatch,
    IndexCardinality,
    IndexMember,
    ShapeViolation,
    PassphraseMismatch,
    StoreError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub code: EvidenceCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl Evidence {
    pub fn new(code: EvidenceCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            model: None,
            key: None,
            field: None,
            line: None,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Check {
    pub id: CheckId,
    pub status: CheckStatus,
    pub severity: Severity,
    /// Items examined.
    pub checked: u64,
    /// Problems found; `evidence` holds at most [`EVIDENCE_LIMIT`].
    pub issues: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<Evidence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_actions: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pre,
    Post,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationReport {
    pub phase: Phase,
    pub checked_at: String,
    pub checks: Vec<Check>,
    pub status: CheckStatus,
}

impl ValidationReport {
    /// No check failed. Warnings do not fail a stage.
    pub fn passed(&self) -> bool {
        self.status != CheckStatus::Fail
    }

    pub fn check(&self, id: CheckId) -> Option<&Check> {
        self.checks.iter().find(|check| check.id == id)
    }

    pub fn failed(&self) -> Vec<CheckId> {
        self.checks
            .iter()
            .filter(|check| check.status == CheckStatus::Fail)
            .map(|check| check.id)
            .collect()
    }

    /// `{dir}/validate_{phase}.json`, written atomically.
    pub fn save(&self, dir: &Path) -> std::io::Result<std::path::PathBuf> {
        let name = match self.phase {
            Phase::Pre => "validate_pre.json",
            Phase::Post => "validate_post.json",
        };
        let path = dir.join(name);
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|err| err.error)?;
        Ok(path)
    }
}

#[derive(Clone, Debug)]
struct CheckBuilder {
    status: CheckStatus,
    severity: Severity,
    checked: u64,
    issues: u64,
    evidence: Vec<Evidence>,
    suggested_actions: BTreeSet<String>,
}

pub struct ReportBuilder {
    phase: Phase,
    checks: BTreeMap<CheckId, CheckBuilder>,
}

impl ReportBuilder {
    pub fn new(phase: Phase, ids: &[CheckId]) -> Self {
        let checks = ids
            .iter()
            .map(|id| {
                (
                    *id,
                    CheckBuilder {
                        status: CheckStatus::Pass,
                        severity: Severity::Low,
                        checked: 0,
                        issues: 0,
                        evidence: Vec::new(),
                        suggested_actions: BTreeSet::new(),
                    },
                )
            })
            .collect();
        Self { phase, checks }
    }

    fn entry(&mut self, id: CheckId) -> &mut CheckBuilder {
        self.checks.entry(id).or_insert_with(|| CheckBuilder {
            status: CheckStatus::Pass,
            severity: Severity::Low,
            checked: 0,
            issues: 0,
            evidence: Vec::new(),
            suggested_actions: BTreeSet::new(),
        })
    }

    pub fn checked(&mut self, id: CheckId, n: u64) {
        self.entry(id).checked += n;
    }

    pub fn record_issue(
        &mut self,
        id: CheckId,
        status: CheckStatus,
        severity: Severity,
        evidence: Evidence,
        suggested_action: Option<&str>,
    ) {
        let check = self.entry(id);
        check.status = std::cmp::max(check.status, status);
        check.severity = std::cmp::max(check.severity, severity);
        check.issues += 1;
        if check.evidence.len() < EVIDENCE_LIMIT {
            check.evidence.push(evidence);
        }
        if let Some(action) = suggested_action {
            check.suggested_actions.insert(action.to_string());
        }
    }

    pub fn finish(self) -> ValidationReport {
        let checks: Vec<Check> = self
            .checks
            .into_iter()
            .map(|(id, builder)| Check {
                id,
                status: builder.status,
                severity: builder.severity,
                checked: builder.checked,
                issues: builder.issues,
                evidence: builder.evidence,
                suggested_actions: builder.suggested_actions.into_iter().collect(),
            })
            .collect();
        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(CheckStatus::Pass);
        for check in &checks {
            match check.status {
                CheckStatus::Pass => tracing::debug!(check = %check.id, checked = check.checked, "check passed"),
                status => tracing::warn!(
                    check = %check.id,
                    %status,
                    issues = check.issues,
                    "check reported issues"
                ),
            }
        }
        ValidationReport {
            phase: self.phase,
            checked_at: now_rfc3339(),
            checks,
            status,
        }
    }
}
