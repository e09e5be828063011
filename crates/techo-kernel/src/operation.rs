//! Operations and actions.
//!
//! An [`Operation`] is a validated state transition applied by the reducer.
//! An [`Action`] is a side effect the reducer asks the session to perform
//! against the execution backend.

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

use techo_delta::Delta;
use techo_types::{
    CellId, CellKind, CellOutput, ClientId, EvaluationResult, Locator, SectionId,
};

/// Every state transition of a notebook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    // ── Structure ────────────────────────────────────────────────────────
    InsertSection {
        index: usize,
        id: SectionId,
        #[serde(default)]
        parent_id: Option<SectionId>,
    },
    InsertCell {
        section_id: SectionId,
        index: usize,
        kind: CellKind,
        id: CellId,
    },
    DeleteSection {
        id: SectionId,
        /// Delete the cells too instead of moving them to the preceding section.
        #[serde(default)]
        delete_cells: bool,
    },
    DeleteCell {
        id: CellId,
    },
    RestoreCell {
        id: CellId,
    },
    MoveCell {
        id: CellId,
        offset: isize,
    },
    MoveSection {
        id: SectionId,
        offset: isize,
    },
    SetSectionParent {
        id: SectionId,
        parent_id: SectionId,
    },
    UnsetSectionParent {
        id: SectionId,
    },
    SetNotebookName {
        name: String,
    },
    SetSectionName {
        id: SectionId,
        name: String,
    },

    // ── Evaluation ───────────────────────────────────────────────────────
    QueueCellEvaluation {
        id: CellId,
    },
    QueueSectionEvaluation {
        id: SectionId,
    },
    CancelCellEvaluation {
        id: CellId,
    },
    AddCellEvaluationOutput {
        id: CellId,
        output: CellOutput,
    },
    AddCellEvaluationResponse {
        id: CellId,
        result: EvaluationResult,
    },
    EraseOutputs,
    ReflectEvaluationFailure {
        #[serde(default)]
        section_id: Option<SectionId>,
    },

    // ── Collaboration ────────────────────────────────────────────────────
    ApplyCellDelta {
        client_id: ClientId,
        cell_id: CellId,
        delta: Delta,
        revision: u64,
    },
    ReportCellRevision {
        client_id: ClientId,
        cell_id: CellId,
        revision: u64,
    },
    ClientJoin {
        client_id: ClientId,
    },
    ClientLeave {
        client_id: ClientId,
    },

    // ── Persistence ──────────────────────────────────────────────────────
    MarkAsSaved,
}

impl Operation {
    /// Snake-case name, used as the broadcast subject suffix.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Operations only the session itself may issue.
    ///
    /// Clients drive membership through join/leave, and evaluation results
    /// come from the execution backend.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Operation::ClientJoin { .. }
                | Operation::ClientLeave { .. }
                | Operation::AddCellEvaluationOutput { .. }
                | Operation::AddCellEvaluationResponse { .. }
                | Operation::ReflectEvaluationFailure { .. }
                | Operation::MarkAsSaved
        )
    }

    /// The client a collaboration operation is written on behalf of.
    pub fn client_id(&self) -> Option<ClientId> {
        match self {
            Operation::ApplyCellDelta { client_id, .. }
            | Operation::ReportCellRevision { client_id, .. }
            | Operation::ClientJoin { client_id }
            | Operation::ClientLeave { client_id } => Some(*client_id),
            _ => None,
        }
    }
}

/// A side effect for the execution backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Evaluate `code` in `locator.container`, continuing from `prev_locator`
    /// (or a fresh container when `None`).
    ///
    /// `run` numbers evaluations within the notebook; the backend echoes it
    /// so reports from an abandoned run can be told apart.
    StartEvaluation {
        locator: Locator,
        prev_locator: Option<Locator>,
        code: String,
        run: u64,
    },
    /// Interrupt whatever the container is running.
    StopEvaluation { section_id: SectionId },
    /// Release the state held for one evaluation.
    ForgetEvaluation { locator: Locator },
    /// Tear down a container.
    DropContainer { section_id: SectionId },
}
