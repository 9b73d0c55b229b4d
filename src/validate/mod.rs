//! Pre- and post-load validation.
//!
//! Every check runs independently and reports `pass`, `warn` or `fail` with
//! evidence. Only `fail` fails the stage.

mod post;
mod pre;
mod report;

pub use post::{DEFAULT_SAMPLE_SIZE, validate_post};
pub use pre::validate_pre;
pub use report::{
    Check, CheckId, CheckStatus, EVIDENCE_LIMIT, Evidence, EvidenceCode, Phase, ReportBuilder,
    Severity, ValidationReport,
};
