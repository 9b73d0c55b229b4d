//! Pipeline orchestrator.
//!
//! Stages run strictly in order: transform, pre-load validation, load, index
//! rebuild, post-load validation. Each stage's report is written to the run
//! manifest before the next one starts, so a single stage can be re-run
//! later against the artifacts on disk.

mod report;
mod stage;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::inspect::{DEFAULT_SCRATCH_PREFIX, sweep_scratch};
use crate::load::{LoadOptions, LoadPolicy, load_shadow, load_transformed};
use crate::rebuild::rebuild_all;
use crate::snapshot::RunManifest;
use crate::store::{MemoryStore, Store};
use crate::transform::{PhasePlan, TRANSFORMED_DIR, TransformOptions, run_transform};
use crate::validate::{DEFAULT_SAMPLE_SIZE, ValidationReport, validate_post, validate_pre};
use crate::{Error, Result};

pub use report::{
    ErrorClass, ErrorEntry, StageLog, StageReport, StageStatus, now_rfc3339,
};
pub use stage::{PipelineState, Stage};

pub const DEFAULT_MAX_ERRORS: usize = 100;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot run {stage}: {reason}")]
    Precondition { stage: Stage, reason: String },
    #[error("input directory {path:?} does not exist")]
    MissingInput { path: PathBuf },
    #[error("transform worker for `{model}` panicked")]
    WorkerPanicked { model: String },
    #[error("system clock is unusable: {0}")]
    Clock(String),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Snapshot directory. Only the transform stage reads it.
    pub input: Option<PathBuf>,
    pub output: PathBuf,
    pub policy: LoadPolicy,
    pub dry_run: bool,
    pub scratch_prefix: String,
    pub max_errors: usize,
    pub sample_size: usize,
}

impl PipelineOptions {
    pub fn new(input: Option<PathBuf>, output: PathBuf) -> Self {
        Self {
            input,
            output,
            policy: LoadPolicy::default(),
            dry_run: false,
            scratch_prefix: DEFAULT_SCRATCH_PREFIX.to_string(),
            max_errors: DEFAULT_MAX_ERRORS,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }
}

/// Outcome of [`Pipeline::run_all`].
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub state: PipelineState,
    pub manifest: RunManifest,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Complete
    }
}

pub struct Pipeline<'a> {
    plan: PhasePlan,
    store: &'a dyn Store,
    options: PipelineOptions,
}

impl<'a> Pipeline<'a> {
    /// Pipeline over the standard phase plan. Fails if the plan is invalid.
    pub fn new(store: &'a dyn Store, options: PipelineOptions) -> Result<Self> {
        Ok(Self::with_plan(PhasePlan::standard()?, store, options))
    }

    pub fn with_plan(plan: PhasePlan, store: &'a dyn Store, options: PipelineOptions) -> Self {
        Self {
            plan,
            store,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run every stage in order, halting at the first failure.
    pub fn run_all(&self) -> Result<RunSummary> {
        let memory = MemoryStore::new();
        let work = self.work_store(&memory);
        self.sweep(work)?;

        let mut manifest = RunManifest::new(self.options.dry_run, self.options.input.clone());
        let mut state = PipelineState::start();
        while let PipelineState::At(stage) = state {
            self.check_preconditions(stage, &manifest)?;
            let report = self.execute(stage, work, &mut manifest)?;
            state = state.advance(report.status == StageStatus::Completed);
        }

        if let Err(err) = self.sweep(work) {
            warn!(error = %err, "scratch sweep after run failed");
        }
        match state {
            PipelineState::Complete => info!(run_id = %manifest.run_id, "pipeline complete"),
            PipelineState::Failed { stage } => {
                warn!(run_id = %manifest.run_id, %stage, "pipeline halted")
            }
            PipelineState::At(_) => {}
        }
        Ok(RunSummary { state, manifest })
    }

    /// Run exactly one stage against the manifest and artifacts already in
    /// the output directory. Transform starts a fresh manifest.
    pub fn run_stage(&self, stage: Stage) -> Result<StageReport> {
        let mut manifest = match (stage, RunManifest::load(&self.options.output)?) {
            (Stage::Transform, _) | (_, None) => {
                RunManifest::new(self.options.dry_run, self.options.input.clone())
            }
            (_, Some(manifest)) => manifest,
        };
        self.check_preconditions(stage, &manifest)?;

        let memory = MemoryStore::new();
        let work = self.work_store(&memory);
        if stage == Stage::Transform {
            self.sweep(work)?;
        }
        if self.options.dry_run {
            self.replay_shadow(stage, &memory)?;
        }
        let report = self.execute(stage, work, &mut manifest)?;
        if stage == Stage::Transform
            && let Err(err) = self.sweep(work)
        {
            warn!(error = %err, "scratch sweep after transform failed");
        }
        Ok(report)
    }

    /// Store that scratch keys, loaded records and indexes go to. Dry runs
    /// use an in-memory shadow and only ever read the target.
    fn work_store<'s>(&'s self, memory: &'s MemoryStore) -> &'s dyn Store {
        if self.options.dry_run {
            memory
        } else {
            self.store
        }
    }

    /// A single dry-run stage starts from an empty shadow. Replay the
    /// stages before it so the stage sees what a full dry run would.
    fn replay_shadow(&self, stage: Stage, shadow: &MemoryStore) -> Result<()> {
        if stage < Stage::RebuildIndex {
            return Ok(());
        }
        let mut log = StageLog::new(0);
        load_shadow(
            self.store,
            shadow,
            &self.plan.sources(),
            &self.load_options(),
            &mut log,
        )?;
        if stage > Stage::RebuildIndex {
            rebuild_all(shadow, false, &mut log)?;
        }
        Ok(())
    }

    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            output: self.options.output.clone(),
            policy: self.options.policy,
        }
    }

    fn sweep(&self, scratch: &dyn Store) -> Result<()> {
        let swept = sweep_scratch(scratch, &self.options.scratch_prefix)?;
        if swept > 0 {
            warn!(swept, prefix = %self.options.scratch_prefix, "removed leftover scratch keys");
        }
        Ok(())
    }

    pub fn check_preconditions(&self, stage: Stage, manifest: &RunManifest) -> Result<()> {
        let unmet = |reason: &str| -> Result<()> {
            Err(PipelineError::Precondition {
                stage,
                reason: reason.to_string(),
            }
            .into())
        };
        match stage {
            Stage::Transform => match &self.options.input {
                Some(input) if input.is_dir() => Ok(()),
                Some(input) => Err(PipelineError::MissingInput {
                    path: input.clone(),
                }
                .into()),
                None => unmet("no input directory given"),
            },
            Stage::ValidatePre => {
                if !manifest.is_completed(Stage::Transform) {
                    return unmet("transform has not completed");
                }
                if !self.options.output.join(TRANSFORMED_DIR).is_dir() {
                    return unmet("transformed/ is missing from the output directory");
                }
                Ok(())
            }
            Stage::Load => {
                if !manifest.is_completed(Stage::Transform) {
                    return unmet("transform has not completed");
                }
                if manifest.status(Stage::ValidatePre) == Some(StageStatus::Failed) {
                    return unmet("pre-load validation failed");
                }
                Ok(())
            }
            Stage::RebuildIndex => {
                if !manifest.is_completed(Stage::Load) {
                    return unmet("load has not completed");
                }
                Ok(())
            }
            Stage::ValidatePost => {
                if !manifest.is_completed(Stage::RebuildIndex) {
                    return unmet("index rebuild has not completed");
                }
                Ok(())
            }
        }
    }

    /// Run one stage, record its report in the manifest and save it.
    ///
    /// Fatal errors are recorded as a failed stage rather than returned, so
    /// the manifest always reflects the last attempt. Only manifest I/O
    /// errors propagate.
    fn execute(
        &self,
        stage: Stage,
        work: &dyn Store,
        manifest: &mut RunManifest,
    ) -> Result<StageReport> {
        let span = info_span!("stage", stage = %stage, dry_run = self.options.dry_run);
        let _guard = span.enter();
        let started_at = now_rfc3339();
        info!("stage started");

        let (log, succeeded) = match self.run_one(stage, work) {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "stage aborted");
                let mut log = StageLog::new(self.options.max_errors);
                log.fail(err.to_string());
                (log, false)
            }
        };
        let status = if succeeded {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        };
        let report = log.finish(stage, status, started_at);
        info!(
            status = ?report.status,
            errors = report.error_count,
            "stage finished"
        );
        manifest.record(report.clone());
        manifest.save(&self.options.output)?;
        Ok(report)
    }

    fn run_one(&self, stage: Stage, work: &dyn Store) -> Result<(StageLog, bool)> {
        let options = &self.options;
        let sources = self.plan.sources();
        let mut log = StageLog::new(options.max_errors);
        match stage {
            Stage::Transform => {
                let input = options.input.clone().ok_or_else(|| {
                    Error::from(PipelineError::Precondition {
                        stage,
                        reason: "no input directory given".into(),
                    })
                })?;
                let outcome = run_transform(
                    &self.plan,
                    work,
                    &TransformOptions {
                        input,
                        output: options.output.clone(),
                        scratch_prefix: options.scratch_prefix.clone(),
                        max_errors: options.max_errors,
                    },
                )?;
                let mut log = outcome.log;
                for (kind, size) in outcome.tables.sizes() {
                    log.add(&format!("mappings.{kind}"), size as u64);
                }
                Ok((log, true))
            }
            Stage::ValidatePre => {
                let report = validate_pre(&options.output, &sources)?;
                Ok(self.validation_outcome(report, log)?)
            }
            Stage::Load => {
                let load = self.load_options();
                let summary = if options.dry_run {
                    load_shadow(self.store, work, &sources, &load, &mut log)?
                } else {
                    load_transformed(self.store, &sources, &load, &mut log)?
                };
                if summary.failed > 0 {
                    log.fail(format!("{} record(s) failed to load", summary.failed));
                }
                Ok((log, summary.failed == 0))
            }
            Stage::RebuildIndex => {
                rebuild_all(work, false, &mut log)?;
                Ok((log, true))
            }
            Stage::ValidatePost => {
                let report = validate_post(work, &options.output, &sources, options.sample_size)?;
                Ok(self.validation_outcome(report, log)?)
            }
        }
    }

    fn validation_outcome(
        &self,
        report: ValidationReport,
        mut log: StageLog,
    ) -> Result<(StageLog, bool)> {
        let path = report
            .save(&self.options.output)
            .map_err(|source| PipelineError::Io {
                path: self.options.output.clone(),
                source,
            })?;
        for check in &report.checks {
            log.add(&format!("checks.{}", check.status), 1);
            log.add(&format!("issues.{}", check.id), check.issues);
        }
        let passed = report.passed();
        if !passed {
            let failed: Vec<&str> = report.failed().iter().map(|id| id.as_str()).collect();
            log.fail(format!("failed checks: {}", failed.join(", ")));
        }
        info!(report = %path.display(), status = %report.status, "validation report written");
        Ok((log, passed))
    }
}

/// Manifest in `output`, if a run has written one.
pub fn load_manifest(output: &Path) -> Result<Option<RunManifest>> {
    Ok(RunManifest::load(output)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_stages_need_earlier_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::new();
        let pipeline = Pipeline::new(
            &store,
            PipelineOptions::new(None, dir.path().join("out")),
        )
        .expect("pipeline");
        let manifest = RunManifest::new(false, None);
        for stage in [Stage::ValidatePre, Stage::Load, Stage::RebuildIndex, Stage::ValidatePost] {
            let err = pipeline
                .check_preconditions(stage, &manifest)
                .expect_err("unmet");
            assert!(
                matches!(err, Error::Pipeline(PipelineError::Precondition { stage: s, .. }) if s == stage),
                "{err}"
            );
        }
        assert!(matches!(
            pipeline.check_preconditions(Stage::Transform, &manifest),
            Err(Error::Pipeline(PipelineError::Precondition { .. }))
        ));
    }

    #[test]
    fn load_refuses_after_failed_pre_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::new();
        let pipeline = Pipeline::new(&store, PipelineOptions::new(None, dir.path().to_path_buf()))
            .expect("pipeline");
        let mut manifest = RunManifest::new(false, None);
        manifest.record(StageLog::new(1).finish(
            Stage::Transform,
            StageStatus::Completed,
            now_rfc3339(),
        ));
        assert!(pipeline.check_preconditions(Stage::Load, &manifest).is_ok());
        manifest.record(StageLog::new(1).finish(
            Stage::ValidatePre,
            StageStatus::Failed,
            now_rfc3339(),
        ));
        assert!(pipeline.check_preconditions(Stage::Load, &manifest).is_err());
    }

    #[test]
    fn missing_input_is_reported_before_anything_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::new();
        let pipeline = Pipeline::new(
            &store,
            PipelineOptions::new(Some(dir.path().join("absent")), dir.path().join("out")),
        )
        .expect("pipeline");
        let err = pipeline.run_all().expect_err("missing input");
        assert!(matches!(
            err,
            Error::Pipeline(PipelineError::MissingInput { .. })
        ));
        assert!(!dir.path().join("out").join("manifest.json").exists());
    }
}
