//! Snapshot codec: records, line files, the run manifest, and store export.

mod codec;
mod export;
mod manifest;
mod record;

use std::path::PathBuf;

use thiserror::Error;

use crate::error::{Effect, Transience};

pub use codec::{SnapshotLine, SnapshotReader, SnapshotWriter};
pub use export::{ExportReport, export_store};
pub use manifest::{MANIFEST_FILE, ManifestError, RunManifest};
pub use record::{KeyParts, Record, RecordValue};

pub const SNAPSHOT_EXT: &str = "jsonl";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line_no}: {reason}")]
    Parse {
        line_no: usize,
        reason: String,
        /// The undecodable line, kept so it can be preserved elsewhere.
        raw: String,
    },
    #[error("failed to encode record `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CodecError {
    /// Per-line errors are counted and skipped; anything else stops the file.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CodecError::Parse { .. })
    }

    pub fn transience(&self) -> Transience {
        match self {
            CodecError::Io { .. } => Transience::Unknown,
            CodecError::Parse { .. } | CodecError::Encode { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            CodecError::Io { .. } => Effect::Unknown,
            CodecError::Parse { .. } | CodecError::Encode { .. } => Effect::None,
        }
    }
}

/// `{dir}/{source}.jsonl`
pub fn snapshot_path(dir: &std::path::Path, source: &str) -> PathBuf {
    dir.join(format!("{source}.{SNAPSHOT_EXT}"))
}
