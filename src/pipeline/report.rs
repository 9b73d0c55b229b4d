//! Per-stage counters and error lists recorded in the manifest.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::Stage;

/// Per-record error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Parse,
    Materialize,
    LookupMiss,
    UnknownField,
    UnmappedValue,
    Coerce,
    Store,
    Invariant,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Parse => "parse",
            ErrorClass::Materialize => "materialize",
            ErrorClass::LookupMiss => "lookup_miss",
            ErrorClass::UnknownField => "unknown_field",
            ErrorClass::UnmappedValue => "unmapped_value",
            ErrorClass::Coerce => "coerce",
            ErrorClass::Store => "store",
            ErrorClass::Invariant => "invariant",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub class: ErrorClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub message: String,
}

impl ErrorEntry {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            model: None,
            key: None,
            line: None,
            message: message.into(),
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

    pub fn line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: String,
    pub finished_at: String,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
    pub error_count: u64,
    /// First N errors; `error_count` is the full total.
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl StageReport {
    pub fn count(&self, name: &str) -> u64 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn errors_of(&self, class: ErrorClass) -> impl Iterator<Item = &ErrorEntry> {
        self.errors.iter().filter(move |entry| entry.class == class)
    }
}

/// Accumulates counters and errors until end of stage.
#[derive(Clone, Debug)]
pub struct StageLog {
    max_errors: usize,
    counts: BTreeMap<String, u64>,
    error_count: u64,
    errors: Vec<ErrorEntry>,
    failure: Option<String>,
}

impl StageLog {
    pub fn new(max_errors: usize) -> Self {
        Self {
            max_errors,
            counts: BTreeMap::new(),
            error_count: 0,
            errors: Vec::new(),
            failure: None,
        }
    }

    pub fn add(&mut self, name: &str, n: u64) {
        *self.counts.entry(name.to_string()).or_default() += n;
    }

    pub fn bump(&mut self, name: &str) {
        self.add(name, 1);
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn error(&mut self, entry: ErrorEntry) {
        tracing::warn!(
            class = %entry.class,
            model = entry.model.as_deref().unwrap_or(""),
            key = entry.key.as_deref().unwrap_or(""),
            "{}",
            entry.message
        );
        self.error_count += 1;
        *self
            .counts
            .entry(format!("errors.{}", entry.class))
            .or_default() += 1;
        if self.errors.len() < self.max_errors {
            self.errors.push(entry);
        }
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    /// Mark the stage as failed with a fatal reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Fold a worker's log into this one, keeping the error cap.
    pub fn absorb(&mut self, other: StageLog) {
        for (name, n) in other.counts {
            *self.counts.entry(name).or_default() += n;
        }
        self.error_count += other.error_count;
        let room = self.max_errors.saturating_sub(self.errors.len());
        self.errors.extend(other.errors.into_iter().take(room));
        if self.failure.is_none() {
            self.failure = other.failure;
        }
    }

    pub fn finish(self, stage: Stage, status: StageStatus, started_at: String) -> StageReport {
        StageReport {
            stage,
            status,
            started_at,
            finished_at: now_rfc3339(),
            counts: self.counts,
            error_count: self.error_count,
            errors: self.errors,
            failure: self.failure,
        }
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}
