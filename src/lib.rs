#![forbid(unsafe_code)]

//! Resumable v1 -> v2 schema migration and index rebuild for key-value
//! store snapshots.
//!
//! The pipeline reads a snapshot exported by [`snapshot::export_store`],
//! rewrites it through the phased routers in [`transform`], validates the
//! result, loads it into a target [`store::Store`], rebuilds the derived
//! indexes and validates again. Every stage records its outcome in a
//! [`snapshot::RunManifest`] so a run can be resumed stage by stage.

pub mod cli;
pub mod config;
pub mod error;
pub mod ident;
pub mod inspect;
pub mod load;
pub mod model;
pub mod paths;
pub mod pipeline;
pub mod rebuild;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod transform;
pub mod validate;

pub use error::{Effect, Error, Transience};
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub use pipeline::{Pipeline, PipelineOptions, RunSummary, Stage};
pub use store::{MemoryStore, SqliteStore, Store};
