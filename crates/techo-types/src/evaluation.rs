//! Evaluation vocabulary shared by the reducer, the orchestrator and the
//! execution backend.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::{CellId, SectionId};
use crate::notebook::CellOutput;

/// Scheduling state of a code cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum EvaluationStatus {
    /// Neither evaluating nor waiting in a queue.
    #[default]
    #[strum(serialize = "fresh", serialize = "ready", serialize = "idle")]
    Fresh,
    /// Currently running in its section's container.
    Evaluating,
    /// Waiting in its section's evaluation queue.
    Queued,
}

impl EvaluationStatus {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationStatus::Fresh => "fresh",
            EvaluationStatus::Evaluating => "evaluating",
            EvaluationStatus::Queued => "queued",
        }
    }

    /// Evaluating or queued.
    pub fn is_busy(&self) -> bool {
        !matches!(self, EvaluationStatus::Fresh)
    }
}

impl std::fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How trustworthy a code cell's last result is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ValidityStatus {
    /// Never produced a result.
    #[default]
    Fresh,
    /// Produced a response and nothing upstream changed since.
    Evaluated,
    /// Produced a response, but an upstream dependency changed since.
    Stale,
    /// Last evaluation failed, was cancelled, or its container was lost.
    #[strum(serialize = "aborted", serialize = "error")]
    Aborted,
}

impl ValidityStatus {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidityStatus::Fresh => "fresh",
            ValidityStatus::Evaluated => "evaluated",
            ValidityStatus::Stale => "stale",
            ValidityStatus::Aborted => "aborted",
        }
    }

    /// Whether a result of this cell still lives in its container.
    pub fn has_result(&self) -> bool {
        matches!(self, ValidityStatus::Evaluated | ValidityStatus::Stale)
    }
}

impl std::fmt::Display for ValidityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Address of one evaluation: the container (section) and the evaluation
/// reference (cell) inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub container: SectionId,
    pub evaluation: CellId,
}

impl Locator {
    pub fn new(container: SectionId, evaluation: CellId) -> Self {
        Self { container, evaluation }
    }
}

/// Metadata reported with a terminal evaluation response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationMetadata {
    /// Wall time spent evaluating, as measured by the backend.
    #[serde(default)]
    pub evaluation_time_ms: u64,
    /// The evaluation raised an error.
    #[serde(default)]
    pub errored: bool,
}

/// Terminal response for one evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub output: CellOutput,
    #[serde(default)]
    pub metadata: EvaluationMetadata,
}

impl EvaluationResult {
    /// A successful response carrying `output`.
    pub fn success(output: CellOutput) -> Self {
        Self {
            output,
            metadata: EvaluationMetadata::default(),
        }
    }

    /// An error response; the cell ends up aborted.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: CellOutput::Error {
                message: message.into(),
            },
            metadata: EvaluationMetadata {
                evaluation_time_ms: 0,
                errored: true,
            },
        }
    }

    /// Attach the backend-measured evaluation time.
    pub fn with_time(mut self, evaluation_time_ms: u64) -> Self {
        self.metadata.evaluation_time_ms = evaluation_time_ms;
        self
    }
}
