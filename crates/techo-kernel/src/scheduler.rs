//! Evaluation scheduling policy.
//!
//! Each section is one evaluation container running at most one cell at a
//! time from a FIFO queue. A branched section continues from its parent's
//! container, so its queue head may only start once no cell of its chain in
//! another section is still evaluating or queued.
//!
//! Staleness is forward-only: when a cell changes or re-evaluates, cells whose
//! chain contains it flip from `evaluated` to `stale`. Nothing re-evaluates on
//! its own.
//!
//! These helpers mutate a state the reducer already owns; they never fail.
//! Preconditions are checked by the reducer before calling in.

use techo_types::{CellId, EvaluationStatus, Locator, SectionId, ValidityStatus};

use crate::data::NotebookState;
use crate::operation::Action;

// ============================================================================
// Queueing
// ============================================================================

/// Append a code cell to its section queue.
pub(crate) fn enqueue(state: &mut NotebookState, section_id: SectionId, cell_id: CellId) {
    if let Some(info) = state.section_infos.get_mut(&section_id) {
        info.evaluation_queue.push_back(cell_id);
    }
    if let Some(info) = state.cell_infos.get_mut(&cell_id) {
        info.evaluation_status = EvaluationStatus::Queued;
    }
}

/// Reset a cell taken out of the schedule.
///
/// Status becomes `fresh`; an `evaluated` result becomes `stale`, any other
/// validity is kept.
pub(crate) fn reset_dequeued(state: &mut NotebookState, cell_id: &CellId) {
    if let Some(info) = state.cell_infos.get_mut(cell_id) {
        info.evaluation_status = EvaluationStatus::Fresh;
        if info.validity_status == ValidityStatus::Evaluated {
            info.validity_status = ValidityStatus::Stale;
        }
    }
}

/// Remove one queued cell from its section queue.
pub(crate) fn dequeue_cell(state: &mut NotebookState, section_id: &SectionId, cell_id: &CellId) {
    if let Some(info) = state.section_infos.get_mut(section_id) {
        info.evaluation_queue.retain(|id| id != cell_id);
    }
    reset_dequeued(state, cell_id);
}

/// Empty a section queue. The evaluating cell, if any, is left alone.
pub(crate) fn dequeue_section(state: &mut NotebookState, section_id: &SectionId) {
    let drained: Vec<CellId> = match state.section_infos.get_mut(section_id) {
        Some(info) => info.evaluation_queue.drain(..).collect(),
        None => return,
    };
    for cell_id in &drained {
        reset_dequeued(state, cell_id);
    }
}

/// Stop tracking the evaluating cell of a section, marking it `aborted`.
///
/// Returns the cell that was evaluating.
pub(crate) fn abort_evaluating(state: &mut NotebookState, section_id: &SectionId) -> Option<CellId> {
    let cell_id = state
        .section_infos
        .get_mut(section_id)
        .and_then(|info| info.evaluating_cell_id.take())?;
    if let Some(info) = state.cell_infos.get_mut(&cell_id) {
        info.evaluation_status = EvaluationStatus::Fresh;
        info.validity_status = ValidityStatus::Aborted;
    }
    Some(cell_id)
}

// ============================================================================
// Staleness
// ============================================================================

/// Flip `evaluated` cells among `cell_ids` to `stale`.
pub(crate) fn mark_stale<'a>(state: &mut NotebookState, cell_ids: impl IntoIterator<Item = &'a CellId>) {
    for cell_id in cell_ids {
        if let Some(info) = state.cell_infos.get_mut(cell_id) {
            if info.validity_status == ValidityStatus::Evaluated {
                info.validity_status = ValidityStatus::Stale;
            }
        }
    }
}

/// Flip every `evaluated` descendant of `cell_id` to `stale`.
pub(crate) fn mark_descendants_stale(state: &mut NotebookState, cell_id: &CellId) {
    let children = state.notebook.child_cells(cell_id);
    mark_stale(state, &children);
}

// ============================================================================
// Starting
// ============================================================================

/// Locator of the nearest `evaluated` cell in the chain of `cell_id`.
pub fn prev_locator(state: &NotebookState, cell_id: &CellId) -> Option<Locator> {
    state
        .notebook
        .parent_cells_with_section(cell_id)
        .into_iter()
        .rev()
        .find(|(id, _)| state.validity_status(id) == Some(ValidityStatus::Evaluated))
        .map(|(id, section_id)| Locator::new(section_id, id))
}

/// Whether the head of a queue may start now.
///
/// The section must be idle and no chain cell living in another section may
/// be evaluating or queued.
pub fn is_ready(state: &NotebookState, section_id: &SectionId, cell_id: &CellId) -> bool {
    let idle = state.section_info(section_id).is_some_and(|info| info.is_idle());
    idle && state
        .notebook
        .parent_cells_with_section(cell_id)
        .iter()
        .filter(|(_, owner)| owner != section_id)
        .all(|(id, _)| {
            state
                .evaluation_status(id)
                .is_none_or(|status| !status.is_busy())
        })
}

/// Start every queue head that is ready, scanning sections in document order.
///
/// Parents precede their branches, so one pass sees every start a parent's
/// progress could block.
pub(crate) fn start_ready(state: &mut NotebookState, actions: &mut Vec<Action>) {
    let section_ids: Vec<SectionId> = state.notebook.sections.iter().map(|s| s.id).collect();
    for section_id in section_ids {
        let Some(head) = state
            .section_info(&section_id)
            .and_then(|info| info.evaluation_queue.front().copied())
        else {
            continue;
        };
        if !is_ready(state, &section_id, &head) {
            continue;
        }
        if let Some(info) = state.section_infos.get_mut(&section_id) {
            info.evaluation_queue.pop_front();
        }
        start_evaluation(state, section_id, head, actions);
    }
}

/// Make `cell_id` the evaluating cell of its section and emit the start action.
fn start_evaluation(
    state: &mut NotebookState,
    section_id: SectionId,
    cell_id: CellId,
    actions: &mut Vec<Action>,
) {
    let prev_locator = prev_locator(state, &cell_id);

    let Some(cell) = state.notebook.find_cell_mut(&cell_id) else {
        return;
    };
    cell.outputs.clear();
    let code = cell.source.clone();

    state.evaluation_runs += 1;
    let run = state.evaluation_runs;

    if let Some(info) = state.section_infos.get_mut(&section_id) {
        info.evaluating_cell_id = Some(cell_id);
    }
    if let Some(info) = state.cell_infos.get_mut(&cell_id) {
        info.evaluation_status = EvaluationStatus::Evaluating;
        info.evaluation_digest = Some(digest(&code));
        info.evaluation_run = run;
    }

    actions.push(Action::StartEvaluation {
        locator: Locator::new(section_id, cell_id),
        prev_locator,
        code,
        run,
    });
}

/// Hex blake3 digest of a cell source.
pub fn digest(source: &str) -> String {
    hex::encode(blake3::hash(source.as_bytes()).as_bytes())
}
