use thiserror::Error;

use crate::config::ConfigError;
use crate::inspect::InspectError;
use crate::pipeline::PipelineError;
use crate::snapshot::{CodecError, ManifestError};
use crate::store::{DumpError, StoreError};
use crate::transform::PlanError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (store writes or files on disk).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the capability errors; per-record failures never
/// reach it, they are logged into the stage report instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Inspect(#[from] InspectError),

    #[error(transparent)]
    Dump(#[from] DumpError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("failed to render json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Store(e) => e.transience(),
            Error::Codec(e) => e.transience(),
            Error::Inspect(InspectError::Store(e)) => e.transience(),
            Error::Manifest(_) | Error::Pipeline(PipelineError::Io { .. }) => Transience::Unknown,
            Error::Inspect(_)
            | Error::Dump(_)
            | Error::Plan(_)
            | Error::Config(_)
            | Error::Json(_)
            | Error::Pipeline(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Store(e) => e.effect(),
            Error::Codec(e) => e.effect(),
            Error::Inspect(InspectError::Store(e)) => e.effect(),
            Error::Manifest(_) | Error::Pipeline(PipelineError::Io { .. }) => Effect::Unknown,
            Error::Pipeline(PipelineError::WorkerPanicked { .. }) => Effect::Some,
            Error::Inspect(_)
            | Error::Dump(_)
            | Error::Plan(_)
            | Error::Config(_)
            | Error::Json(_)
            | Error::Pipeline(_) => Effect::None,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) | Error::Plan(_) => 2,
            Error::Pipeline(PipelineError::Precondition { .. } | PipelineError::MissingInput { .. }) => 3,
            _ => 1,
        }
    }
}
