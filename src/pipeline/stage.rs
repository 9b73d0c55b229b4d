use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Pipeline stages in execution order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Stage {
    Transform,
    ValidatePre,
    Load,
    RebuildIndex,
    ValidatePost,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Transform,
        Stage::ValidatePre,
        Stage::Load,
        Stage::RebuildIndex,
        Stage::ValidatePost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Transform => "transform",
            Stage::ValidatePre => "validate_pre",
            Stage::Load => "load",
            Stage::RebuildIndex => "rebuild_index",
            Stage::ValidatePost => "validate_post",
        }
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Transform => Some(Stage::ValidatePre),
            Stage::ValidatePre => Some(Stage::Load),
            Stage::Load => Some(Stage::RebuildIndex),
            Stage::RebuildIndex => Some(Stage::ValidatePost),
            Stage::ValidatePost => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage `{s}`"))
    }
}

/// Orchestrator state. `Failed` is terminal and reachable from any stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    At(Stage),
    Complete,
    Failed { stage: Stage },
}

impl PipelineState {
    pub fn start() -> Self {
        PipelineState::At(Stage::Transform)
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, PipelineState::At(_))
    }

    /// Transition after the current stage finished.
    pub fn advance(self, succeeded: bool) -> Self {
        match self {
            PipelineState::At(stage) if !succeeded => PipelineState::Failed { stage },
            PipelineState::At(stage) => match stage.next() {
                Some(next) => PipelineState::At(next),
                None => PipelineState::Complete,
            },
            terminal => terminal,
        }
    }
}
