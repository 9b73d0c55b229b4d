//! Per-run manifest: the durable audit trail between stages.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{Stage, StageReport, StageStatus, now_rfc3339};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest {path:?} is invalid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to persist manifest to {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageReport>,
}

impl RunManifest {
    pub fn new(dry_run: bool, input: Option<PathBuf>) -> Self {
        let now = now_rfc3339();
        Self {
            run_id: uuid::Uuid::now_v7().to_string(),
            dry_run,
            input,
            created_at: now.clone(),
            updated_at: now,
            stages: BTreeMap::new(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    pub fn load(dir: &Path) -> Result<Option<Self>, ManifestError> {
        let path = Self::path(dir);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ManifestError::Io { path, source }),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| ManifestError::Json { path, source })
    }

    /// Write atomically next to the final path, then rename over it.
    pub fn save(&self, dir: &Path) -> Result<(), ManifestError> {
        fs::create_dir_all(dir).map_err(|source| ManifestError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = Self::path(dir);
        let json = serde_json::to_vec_pretty(self).map_err(|source| ManifestError::Json {
            path: path.clone(),
            source,
        })?;
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|source| ManifestError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        temp.write_all(&json)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|source| ManifestError::Io {
                path: temp.path().to_path_buf(),
                source,
            })?;
        temp.persist(&path)
            .map_err(|source| ManifestError::Persist { path, source })?;
        Ok(())
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.get(&stage)
    }

    pub fn status(&self, stage: Stage) -> Option<StageStatus> {
        self.stage(stage).map(|report| report.status)
    }

    pub fn is_completed(&self, stage: Stage) -> bool {
        self.status(stage) == Some(StageStatus::Completed)
    }

    /// Replace the entry for `report.stage`.
    pub fn record(&mut self, report: StageReport) {
        self.updated_at = now_rfc3339();
        self.stages.insert(report.stage, report);
    }
}
