//! The operation reducer.
//!
//! `(state, operation) -> (state', actions) | rejection`. The reducer is a
//! pure function of its inputs: replicas that apply the same operation
//! sequence reach identical states. It performs no I/O and emits no logs;
//! side effects are returned as [`Action`]s for the session to carry out.
//!
//! Each operation runs against a scratch copy of the state. A rejection drops
//! the copy, so a failed operation never leaves a partial change behind.

use techo_delta::Delta;
use techo_types::{
    Cell, CellId, CellKind, CellOutput, ClientId, EvaluationResult, EvaluationStatus, Locator,
    Section, SectionId, ValidityStatus,
};

use crate::data::{BinEntry, CellInfo, NotebookState, SectionInfo};
use crate::error::OperationError;
use crate::operation::{Action, Operation};
use crate::scheduler;

type Result<T> = std::result::Result<T, OperationError>;

/// Apply `operation` to `state`, returning the new state and its actions.
pub fn apply_operation(
    state: &NotebookState,
    operation: &Operation,
) -> Result<(NotebookState, Vec<Action>)> {
    let mut next = state.clone();
    let actions = reduce(&mut next, operation)?;
    Ok((next, actions))
}

impl NotebookState {
    /// Apply `operation` in place. On rejection `self` is unchanged.
    pub fn apply(&mut self, operation: &Operation) -> Result<Vec<Action>> {
        let mut next = self.clone();
        let actions = reduce(&mut next, operation)?;
        *self = next;
        Ok(actions)
    }
}

fn reduce(state: &mut NotebookState, operation: &Operation) -> Result<Vec<Action>> {
    let mut actions = Vec::new();

    match operation {
        Operation::InsertSection {
            index,
            id,
            parent_id,
        } => insert_section(state, *index, *id, *parent_id)?,
        Operation::InsertCell {
            section_id,
            index,
            kind,
            id,
        } => insert_cell(state, *section_id, *index, *kind, *id)?,
        Operation::DeleteSection { id, delete_cells } => {
            delete_section(state, *id, *delete_cells, &mut actions)?
        }
        Operation::DeleteCell { id } => delete_cell(state, *id, &mut actions)?,
        Operation::RestoreCell { id } => restore_cell(state, *id)?,
        Operation::MoveCell { id, offset } => move_cell(state, *id, *offset, &mut actions)?,
        Operation::MoveSection { id, offset } => move_section(state, *id, *offset)?,
        Operation::SetSectionParent { id, parent_id } => {
            set_section_parent(state, *id, Some(*parent_id))?
        }
        Operation::UnsetSectionParent { id } => set_section_parent(state, *id, None)?,
        Operation::SetNotebookName { name } => set_notebook_name(state, name)?,
        Operation::SetSectionName { id, name } => set_section_name(state, *id, name)?,

        Operation::QueueCellEvaluation { id } => queue_cell_evaluation(state, *id)?,
        Operation::QueueSectionEvaluation { id } => queue_section_evaluation(state, *id)?,
        Operation::CancelCellEvaluation { id } => {
            cancel_cell_evaluation(state, *id, &mut actions)?
        }
        Operation::AddCellEvaluationOutput { id, output } => {
            add_cell_evaluation_output(state, *id, output)?
        }
        Operation::AddCellEvaluationResponse { id, result } => {
            add_cell_evaluation_response(state, *id, result)?
        }
        Operation::EraseOutputs => erase_outputs(state),
        Operation::ReflectEvaluationFailure { section_id } => {
            reflect_evaluation_failure(state, *section_id)?
        }

        Operation::ApplyCellDelta {
            client_id,
            cell_id,
            delta,
            revision,
        } => apply_cell_delta(state, *client_id, *cell_id, delta, *revision)?,
        Operation::ReportCellRevision {
            client_id,
            cell_id,
            revision,
        } => report_cell_revision(state, *client_id, *cell_id, *revision)?,
        Operation::ClientJoin { client_id } => client_join(state, *client_id)?,
        Operation::ClientLeave { client_id } => client_leave(state, *client_id)?,

        Operation::MarkAsSaved => state.dirty = false,
    }

    scheduler::start_ready(state, &mut actions);
    Ok(actions)
}

// ============================================================================
// Structure
// ============================================================================

fn insert_section(
    state: &mut NotebookState,
    index: usize,
    id: SectionId,
    parent_id: Option<SectionId>,
) -> Result<()> {
    if !state.section_id_unused(&id) {
        return Err(OperationError::DuplicateSection(id));
    }
    let len = state.notebook.sections.len();
    if index > len {
        return Err(OperationError::InvalidIndex { index, len });
    }
    if let Some(parent) = parent_id {
        let parent_index = state
            .notebook
            .section_index(&parent)
            .ok_or(OperationError::SectionNotFound(parent))?;
        if parent_index >= index {
            return Err(OperationError::InvalidParent {
                section: id,
                parent,
            });
        }
    }

    let mut section = Section::new(id);
    section.parent_id = parent_id;
    state.notebook.sections.insert(index, section);
    state.section_infos.insert(id, SectionInfo::default());
    state.dirty = true;
    Ok(())
}

fn insert_cell(
    state: &mut NotebookState,
    section_id: SectionId,
    index: usize,
    kind: CellKind,
    id: CellId,
) -> Result<()> {
    if !state.cell_id_unused(&id) {
        return Err(OperationError::DuplicateCell(id));
    }
    let section = state
        .notebook
        .find_section_mut(&section_id)
        .ok_or(OperationError::SectionNotFound(section_id))?;
    let len = section.cells.len();
    if index > len {
        return Err(OperationError::InvalidIndex { index, len });
    }

    section.cells.insert(index, Cell::new(id, kind));
    let info = CellInfo::new(&state.clients);
    state.cell_infos.insert(id, info);
    state.dirty = true;
    Ok(())
}

fn delete_section(
    state: &mut NotebookState,
    id: SectionId,
    delete_cells: bool,
    actions: &mut Vec<Action>,
) -> Result<()> {
    let index = state
        .notebook
        .section_index(&id)
        .ok_or(OperationError::SectionNotFound(id))?;
    if !state.notebook.child_sections(&id).is_empty() {
        return Err(OperationError::SectionHasBranches(id));
    }

    let cell_ids: Vec<CellId> = state.notebook.sections[index]
        .cells
        .iter()
        .map(|c| c.id)
        .collect();
    let has_container_state = cell_ids.iter().any(|cell_id| {
        state.cell_info(cell_id).is_some_and(|info| {
            info.evaluation_status == EvaluationStatus::Evaluating
                || info.validity_status != ValidityStatus::Fresh
        })
    });

    let evaluating = state
        .section_infos
        .get_mut(&id)
        .and_then(|info| info.evaluating_cell_id.take());
    if let Some(cell_id) = evaluating {
        scheduler::reset_dequeued(state, &cell_id);
        actions.push(Action::StopEvaluation { section_id: id });
    }
    scheduler::dequeue_section(state, &id);
    if has_container_state {
        actions.push(Action::DropContainer { section_id: id });
    }

    let mut section = state.notebook.sections.remove(index);
    state.section_infos.remove(&id);

    if !delete_cells && index > 0 {
        // Cells move to the end of the preceding section.
        let cells = std::mem::take(&mut section.cells);
        let target = &mut state.notebook.sections[index - 1];
        target.cells.extend(cells);
        scheduler::mark_stale(state, &cell_ids);
        for cell_id in &cell_ids {
            scheduler::mark_descendants_stale(state, cell_id);
        }
    } else {
        for cell_id in &cell_ids {
            state.cell_infos.remove(cell_id);
        }
    }

    state.push_bin(BinEntry::Section { section, index });
    state.dirty = true;
    Ok(())
}

fn delete_cell(state: &mut NotebookState, id: CellId, actions: &mut Vec<Action>) -> Result<()> {
    let (section_index, cell_index) = state
        .notebook
        .cell_position(&id)
        .ok_or(OperationError::CellNotFound(id))?;
    let section_id = state.notebook.sections[section_index].id;
    let is_code = state.notebook.sections[section_index].cells[cell_index].is_code();
    let info = state
        .cell_info(&id)
        .ok_or(OperationError::CellNotFound(id))?;
    let (status, validity) = (info.evaluation_status, info.validity_status);

    match status {
        EvaluationStatus::Evaluating => {
            if let Some(info) = state.section_infos.get_mut(&section_id) {
                info.evaluating_cell_id = None;
            }
            actions.push(Action::StopEvaluation { section_id });
            scheduler::dequeue_section(state, &section_id);
        }
        EvaluationStatus::Queued => scheduler::dequeue_cell(state, &section_id, &id),
        EvaluationStatus::Fresh => {}
    }
    if validity.has_result() {
        actions.push(Action::ForgetEvaluation {
            locator: Locator::new(section_id, id),
        });
    }
    if is_code {
        scheduler::mark_descendants_stale(state, &id);
    }

    let cell = state.notebook.sections[section_index]
        .cells
        .remove(cell_index);
    state.cell_infos.remove(&id);
    state.push_bin(BinEntry::Cell {
        cell,
        section_id,
        index: cell_index,
    });
    state.dirty = true;
    Ok(())
}

fn restore_cell(state: &mut NotebookState, id: CellId) -> Result<()> {
    let (cell, section_id, index) = state
        .take_binned_cell(&id)
        .ok_or(OperationError::NotInBin(id))?;
    let invalidates = cell.is_code() && !cell.source.is_empty();

    let section = state
        .notebook
        .find_section_mut(&section_id)
        .ok_or(OperationError::SectionNotFound(section_id))?;
    let index = index.min(section.cells.len());
    section.cells.insert(index, cell);

    let info = CellInfo::new(&state.clients);
    state.cell_infos.insert(id, info);
    if invalidates {
        scheduler::mark_descendants_stale(state, &id);
    }
    state.dirty = true;
    Ok(())
}

fn move_cell(
    state: &mut NotebookState,
    id: CellId,
    offset: isize,
    actions: &mut Vec<Action>,
) -> Result<()> {
    let (from_section, from_index) = state
        .notebook
        .cell_position(&id)
        .ok_or(OperationError::CellNotFound(id))?;
    let info = state
        .cell_info(&id)
        .ok_or(OperationError::CellNotFound(id))?;
    if info.is_busy() {
        return Err(OperationError::CellBusy(id));
    }
    let had_result = info.validity_status.has_result();

    // Position in the flattened cell list, all sections concatenated.
    let flat: Vec<(CellId, SectionId)> = state
        .notebook
        .cells_with_section()
        .map(|(c, s)| (c.id, s))
        .collect();
    let from = flat.iter().position(|(c, _)| *c == id).unwrap_or_default();
    let last = flat.len().saturating_sub(1) as isize;
    let to = (from as isize).saturating_add(offset).clamp(0, last) as usize;
    if to == from {
        return Ok(());
    }

    let old_section_id = state.notebook.sections[from_section].id;
    let is_code = state.notebook.sections[from_section].cells[from_index].is_code();
    let before = if is_code {
        state.notebook.child_cells(&id)
    } else {
        Vec::new()
    };

    let rest: Vec<(CellId, SectionId)> = flat.into_iter().filter(|(c, _)| *c != id).collect();
    let cell = state.notebook.sections[from_section]
        .cells
        .remove(from_index);

    // Moving down lands after the neighbour, moving up lands before it.
    let (anchor, target_section_id, after) = if to > from {
        (rest[to - 1].0, rest[to - 1].1, true)
    } else {
        (rest[to].0, rest[to].1, false)
    };
    let target = state
        .notebook
        .find_section_mut(&target_section_id)
        .ok_or(OperationError::SectionNotFound(target_section_id))?;
    let anchor_index = target
        .cell_index(&anchor)
        .ok_or(OperationError::CellNotFound(anchor))?;
    let insert_at = if after { anchor_index + 1 } else { anchor_index };
    target.cells.insert(insert_at, cell);

    if is_code {
        let after_move = state.notebook.child_cells(&id);
        scheduler::mark_stale(state, [&id]);
        scheduler::mark_stale(state, &before);
        scheduler::mark_stale(state, &after_move);
        if target_section_id != old_section_id && had_result {
            actions.push(Action::ForgetEvaluation {
                locator: Locator::new(old_section_id, id),
            });
        }
    }
    state.dirty = true;
    Ok(())
}

fn move_section(state: &mut NotebookState, id: SectionId, offset: isize) -> Result<()> {
    let from = state
        .notebook
        .section_index(&id)
        .ok_or(OperationError::SectionNotFound(id))?;
    let last = state.notebook.sections.len().saturating_sub(1) as isize;
    let to = (from as isize).saturating_add(offset).clamp(0, last) as usize;
    if to == from {
        return Ok(());
    }

    let section = state.notebook.sections.remove(from);
    state.notebook.sections.insert(to, section);
    if !state.notebook.parents_precede_children() {
        return Err(OperationError::BranchOrder);
    }
    state.dirty = true;
    Ok(())
}

fn set_section_parent(
    state: &mut NotebookState,
    id: SectionId,
    parent_id: Option<SectionId>,
) -> Result<()> {
    let index = state
        .notebook
        .section_index(&id)
        .ok_or(OperationError::SectionNotFound(id))?;
    if let Some(parent) = parent_id {
        let parent_index = state
            .notebook
            .section_index(&parent)
            .ok_or(OperationError::SectionNotFound(parent))?;
        if parent_index >= index {
            return Err(OperationError::InvalidParent {
                section: id,
                parent,
            });
        }
    }
    if state.notebook.sections[index].parent_id == parent_id {
        return Ok(());
    }
    if state.branch_tree_busy(&id) {
        return Err(OperationError::SectionBusy(id));
    }

    state.notebook.sections[index].parent_id = parent_id;
    let affected = state.notebook.cells_in_branch_tree(&id);
    scheduler::mark_stale(state, &affected);
    state.dirty = true;
    Ok(())
}

fn set_notebook_name(state: &mut NotebookState, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(OperationError::EmptyName);
    }
    state.notebook.name = name.to_string();
    state.dirty = true;
    Ok(())
}

fn set_section_name(state: &mut NotebookState, id: SectionId, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(OperationError::EmptyName);
    }
    let section = state
        .notebook
        .find_section_mut(&id)
        .ok_or(OperationError::SectionNotFound(id))?;
    section.name = name.to_string();
    state.dirty = true;
    Ok(())
}

// ============================================================================
// Evaluation
// ============================================================================

/// Section id of a code cell, rejecting markdown and unknown cells.
fn code_cell_section(state: &NotebookState, id: CellId) -> Result<SectionId> {
    let (cell, section) = state
        .notebook
        .find_cell_with_section(&id)
        .ok_or(OperationError::CellNotFound(id))?;
    if !cell.is_code() {
        return Err(OperationError::NotACodeCell(id));
    }
    Ok(section.id)
}

fn queue_cell_evaluation(state: &mut NotebookState, id: CellId) -> Result<()> {
    let section_id = code_cell_section(state, id)?;
    if state.cell_info(&id).is_some_and(CellInfo::is_busy) {
        return Err(OperationError::CellBusy(id));
    }
    scheduler::enqueue(state, section_id, id);
    Ok(())
}

fn queue_section_evaluation(state: &mut NotebookState, id: SectionId) -> Result<()> {
    let section = state
        .notebook
        .find_section(&id)
        .ok_or(OperationError::SectionNotFound(id))?;
    let pending: Vec<CellId> = section
        .code_cell_ids()
        .into_iter()
        .filter(|cell_id| {
            state.cell_info(cell_id).is_some_and(|info| {
                !info.is_busy() && info.validity_status != ValidityStatus::Evaluated
            })
        })
        .collect();
    for cell_id in pending {
        scheduler::enqueue(state, id, cell_id);
    }
    Ok(())
}

fn cancel_cell_evaluation(
    state: &mut NotebookState,
    id: CellId,
    actions: &mut Vec<Action>,
) -> Result<()> {
    let section_id = code_cell_section(state, id)?;
    match state.evaluation_status(&id) {
        Some(EvaluationStatus::Evaluating) => {
            scheduler::abort_evaluating(state, &section_id);
            actions.push(Action::StopEvaluation { section_id });
            scheduler::dequeue_section(state, &section_id);
            for branch_id in state.notebook.branch_descendants(&section_id) {
                scheduler::dequeue_section(state, &branch_id);
            }
            Ok(())
        }
        Some(EvaluationStatus::Queued) => {
            scheduler::dequeue_cell(state, &section_id, &id);
            Ok(())
        }
        _ => Err(OperationError::NotQueuedOrEvaluating(id)),
    }
}

/// The evaluating cell `id`, or a rejection.
fn evaluating_cell(state: &mut NotebookState, id: CellId) -> Result<&mut Cell> {
    if state.evaluation_status(&id) != Some(EvaluationStatus::Evaluating) {
        return match state.notebook.find_cell(&id) {
            Some(_) => Err(OperationError::NotEvaluating(id)),
            None => Err(OperationError::CellNotFound(id)),
        };
    }
    state
        .notebook
        .find_cell_mut(&id)
        .ok_or(OperationError::CellNotFound(id))
}

fn add_cell_evaluation_output(
    state: &mut NotebookState,
    id: CellId,
    output: &CellOutput,
) -> Result<()> {
    let cell = evaluating_cell(state, id)?;
    cell.outputs.push(output.clone());
    state.dirty = true;
    Ok(())
}

fn add_cell_evaluation_response(
    state: &mut NotebookState,
    id: CellId,
    result: &EvaluationResult,
) -> Result<()> {
    let cell = evaluating_cell(state, id)?;
    cell.outputs.push(result.output.clone());
    let current = scheduler::digest(&cell.source);
    let section_id = code_cell_section(state, id)?;

    if let Some(info) = state.section_infos.get_mut(&section_id) {
        info.evaluating_cell_id = None;
    }
    if let Some(info) = state.cell_infos.get_mut(&id) {
        info.evaluation_status = EvaluationStatus::Fresh;
        // The result describes the source the run started with.
        info.validity_status = if result.metadata.errored || result.output.is_error() {
            ValidityStatus::Aborted
        } else if info.evaluation_digest.as_deref() != Some(current.as_str()) {
            ValidityStatus::Stale
        } else {
            ValidityStatus::Evaluated
        };
        info.last_evaluation = Some(result.metadata.clone());
    }
    scheduler::mark_descendants_stale(state, &id);
    state.dirty = true;
    Ok(())
}

fn erase_outputs(state: &mut NotebookState) {
    for section in &mut state.notebook.sections {
        for cell in &mut section.cells {
            cell.outputs.clear();
        }
    }
    state.dirty = true;
}

fn reflect_evaluation_failure(
    state: &mut NotebookState,
    section_id: Option<SectionId>,
) -> Result<()> {
    let targets: Vec<SectionId> = match section_id {
        Some(id) if state.notebook.find_section(&id).is_none() => {
            return Err(OperationError::SectionNotFound(id));
        }
        Some(id) => vec![id],
        None => state.notebook.sections.iter().map(|s| s.id).collect(),
    };

    for section_id in targets {
        scheduler::abort_evaluating(state, &section_id);
        scheduler::dequeue_section(state, &section_id);

        let cell_ids = state
            .notebook
            .find_section(&section_id)
            .map(|s| s.code_cell_ids())
            .unwrap_or_default();
        for cell_id in cell_ids {
            if let Some(info) = state.cell_infos.get_mut(&cell_id) {
                if info.validity_status.has_result() {
                    info.validity_status = ValidityStatus::Aborted;
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Collaboration
// ============================================================================

fn known_client(state: &NotebookState, client_id: ClientId) -> Result<()> {
    if state.clients.contains(&client_id) {
        Ok(())
    } else {
        Err(OperationError::UnknownClient(client_id))
    }
}

fn apply_cell_delta(
    state: &mut NotebookState,
    client_id: ClientId,
    cell_id: CellId,
    delta: &Delta,
    revision: u64,
) -> Result<()> {
    known_client(state, client_id)?;
    let cell = state
        .notebook
        .find_cell_mut(&cell_id)
        .ok_or(OperationError::CellNotFound(cell_id))?;
    let info = state
        .cell_infos
        .get_mut(&cell_id)
        .ok_or(OperationError::CellNotFound(cell_id))?;

    let applied = info
        .revisions
        .apply(&cell.source, delta, revision, client_id)?;
    if applied.delta.is_empty() {
        return Ok(());
    }

    cell.source = applied.source;
    if cell.is_code() && info.validity_status == ValidityStatus::Evaluated {
        info.validity_status = ValidityStatus::Stale;
    }
    state.dirty = true;
    Ok(())
}

fn report_cell_revision(
    state: &mut NotebookState,
    client_id: ClientId,
    cell_id: CellId,
    revision: u64,
) -> Result<()> {
    known_client(state, client_id)?;
    let info = state
        .cell_infos
        .get_mut(&cell_id)
        .ok_or(OperationError::CellNotFound(cell_id))?;
    info.revisions.report_revision(client_id, revision)?;
    Ok(())
}

fn client_join(state: &mut NotebookState, client_id: ClientId) -> Result<()> {
    if !state.clients.insert(client_id) {
        return Err(OperationError::ClientAlreadyJoined(client_id));
    }
    for info in state.cell_infos.values_mut() {
        info.revisions.register_client(client_id);
    }
    Ok(())
}

fn client_leave(state: &mut NotebookState, client_id: ClientId) -> Result<()> {
    if !state.clients.remove(&client_id) {
        return Err(OperationError::UnknownClient(client_id));
    }
    for info in state.cell_infos.values_mut() {
        info.revisions.forget_client(&client_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        state: NotebookState,
        client: ClientId,
    }

    impl Fixture {
        fn new() -> Self {
            let client = ClientId::new();
            let mut state = NotebookState::default();
            state.apply(&Operation::ClientJoin { client_id: client }).unwrap();
            Self { state, client }
        }

        fn ok(&mut self, op: Operation) -> Vec<Action> {
            self.state.apply(&op).unwrap()
        }

        fn section(&mut self, parent_id: Option<SectionId>) -> SectionId {
            let id = SectionId::new();
            let index = self.state.notebook.sections.len();
            self.ok(Operation::InsertSection {
                index,
                id,
                parent_id,
            });
            id
        }

        fn code_cell(&mut self, section_id: SectionId, source: &str) -> CellId {
            let id = CellId::new();
            let index = self.state.notebook.find_section(&section_id).unwrap().cells.len();
            self.ok(Operation::InsertCell {
                section_id,
                index,
                kind: CellKind::Code,
                id,
            });
            if !source.is_empty() {
                self.ok(Operation::ApplyCellDelta {
                    client_id: self.client,
                    cell_id: id,
                    delta: Delta::new().insert(source),
                    revision: 0,
                });
            }
            id
        }

        fn evaluate(&mut self, id: CellId) {
            self.ok(Operation::QueueCellEvaluation { id });
            self.respond(id);
        }

        fn respond(&mut self, id: CellId) -> Vec<Action> {
            self.ok(Operation::AddCellEvaluationResponse {
                id,
                result: EvaluationResult::success(CellOutput::text("ok")),
            })
        }

        fn validity(&self, id: CellId) -> ValidityStatus {
            self.state.validity_status(&id).unwrap()
        }

        fn status(&self, id: CellId) -> EvaluationStatus {
            self.state.evaluation_status(&id).unwrap()
        }
    }

    #[test]
    fn test_rejection_leaves_state_untouched() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let before = fx.state.clone();

        let err = fx
            .state
            .apply(&Operation::InsertSection {
                index: 0,
                id: s1,
                parent_id: None,
            })
            .unwrap_err();
        assert_eq!(err, OperationError::DuplicateSection(s1));
        assert_eq!(fx.state, before);
    }

    #[test]
    fn test_insert_cell_validates_index_and_section() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let err = fx
            .state
            .apply(&Operation::InsertCell {
                section_id: s1,
                index: 3,
                kind: CellKind::Code,
                id: CellId::new(),
            })
            .unwrap_err();
        assert_eq!(err, OperationError::InvalidIndex { index: 3, len: 0 });

        let missing = SectionId::new();
        let err = fx
            .state
            .apply(&Operation::InsertCell {
                section_id: missing,
                index: 0,
                kind: CellKind::Code,
                id: CellId::new(),
            })
            .unwrap_err();
        assert_eq!(err, OperationError::SectionNotFound(missing));
    }

    #[test]
    fn test_queue_emits_start_with_code_and_digest() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let c1 = fx.code_cell(s1, "1 + 1");

        let actions = fx.ok(Operation::QueueCellEvaluation { id: c1 });
        assert_eq!(
            actions,
            vec![Action::StartEvaluation {
                locator: Locator::new(s1, c1),
                prev_locator: None,
                code: "1 + 1".into(),
                run: 1,
            }]
        );
        assert_eq!(
            fx.state.cell_info(&c1).unwrap().evaluation_digest,
            Some(scheduler::digest("1 + 1"))
        );
        assert_eq!(
            fx.state.apply(&Operation::QueueCellEvaluation { id: c1 }),
            Err(OperationError::CellBusy(c1))
        );
    }

    #[test]
    fn test_markdown_cells_cannot_be_queued() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let md = CellId::new();
        fx.ok(Operation::InsertCell {
            section_id: s1,
            index: 0,
            kind: CellKind::Markdown,
            id: md,
        });
        assert_eq!(
            fx.state.apply(&Operation::QueueCellEvaluation { id: md }),
            Err(OperationError::NotACodeCell(md))
        );
    }

    #[test]
    fn test_error_response_aborts_and_still_propagates_staleness() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let c1 = fx.code_cell(s1, "a");
        let c2 = fx.code_cell(s1, "b");
        fx.evaluate(c1);
        fx.evaluate(c2);

        fx.ok(Operation::QueueCellEvaluation { id: c1 });
        fx.ok(Operation::AddCellEvaluationResponse {
            id: c1,
            result: EvaluationResult::error("boom"),
        });

        assert_eq!(fx.validity(c1), ValidityStatus::Aborted);
        assert_eq!(fx.validity(c2), ValidityStatus::Stale);
    }

    #[test]
    fn test_output_requires_evaluating_cell() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let c1 = fx.code_cell(s1, "print(1)");
        let output = CellOutput::stdout("1\n");

        assert_eq!(
            fx.state.apply(&Operation::AddCellEvaluationOutput {
                id: c1,
                output: output.clone()
            }),
            Err(OperationError::NotEvaluating(c1))
        );

        fx.ok(Operation::QueueCellEvaluation { id: c1 });
        fx.ok(Operation::AddCellEvaluationOutput {
            id: c1,
            output: output.clone(),
        });
        fx.respond(c1);
        assert_eq!(
            fx.state.notebook.find_cell(&c1).unwrap().outputs,
            vec![output, CellOutput::text("ok")]
        );
    }

    #[test]
    fn test_cancel_queued_cell_restores_stale() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let c1 = fx.code_cell(s1, "a");
        let c2 = fx.code_cell(s1, "b");
        fx.evaluate(c2);
        fx.ok(Operation::QueueCellEvaluation { id: c1 });
        fx.ok(Operation::QueueCellEvaluation { id: c2 });
        assert_eq!(fx.status(c2), EvaluationStatus::Queued);

        let actions = fx.ok(Operation::CancelCellEvaluation { id: c2 });
        assert!(actions.is_empty());
        assert_eq!(fx.status(c2), EvaluationStatus::Fresh);
        assert_eq!(fx.validity(c2), ValidityStatus::Stale);
        assert_eq!(
            fx.state.apply(&Operation::CancelCellEvaluation { id: c2 }),
            Err(OperationError::NotQueuedOrEvaluating(c2))
        );
    }

    #[test]
    fn test_cancel_evaluating_stops_section_and_branches() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let c1 = fx.code_cell(s1, "a");
        let c2 = fx.code_cell(s1, "b");
        let s2 = fx.section(Some(s1));
        let b1 = fx.code_cell(s2, "c");

        fx.ok(Operation::QueueCellEvaluation { id: c1 });
        fx.ok(Operation::QueueCellEvaluation { id: c2 });
        fx.ok(Operation::QueueCellEvaluation { id: b1 });
        assert_eq!(fx.status(b1), EvaluationStatus::Queued);

        let actions = fx.ok(Operation::CancelCellEvaluation { id: c1 });
        assert_eq!(actions, vec![Action::StopEvaluation { section_id: s1 }]);
        assert_eq!(fx.validity(c1), ValidityStatus::Aborted);
        assert_eq!(fx.status(c2), EvaluationStatus::Fresh);
        assert_eq!(fx.status(b1), EvaluationStatus::Fresh);
        fx.state.check_invariants().unwrap();
    }

    #[test]
    fn test_delta_marks_evaluated_cell_stale() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let c1 = fx.code_cell(s1, "x = 1");
        fx.evaluate(c1);
        fx.ok(Operation::MarkAsSaved);

        fx.ok(Operation::ApplyCellDelta {
            client_id: fx.client,
            cell_id: c1,
            delta: Delta::new().retain(4).delete(1).insert("2"),
            revision: 1,
        });
        let cell = fx.state.notebook.find_cell(&c1).unwrap();
        assert_eq!(cell.source, "x = 2");
        assert_eq!(fx.state.cell_info(&c1).unwrap().source_revision(), 2);
        assert_eq!(fx.validity(c1), ValidityStatus::Stale);
        assert!(fx.state.dirty);
    }

    #[test]
    fn test_edit_during_evaluation_leaves_result_stale() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let c1 = fx.code_cell(s1, "x = 1");
        let c2 = fx.code_cell(s1, "y = 1");

        fx.ok(Operation::QueueCellEvaluation { id: c1 });
        fx.ok(Operation::ApplyCellDelta {
            client_id: fx.client,
            cell_id: c1,
            delta: Delta::new().retain(4).delete(1).insert("2"),
            revision: 1,
        });
        fx.respond(c1);
        assert_eq!(fx.status(c1), EvaluationStatus::Fresh);
        assert_eq!(fx.validity(c1), ValidityStatus::Stale);

        // An edit that restores the evaluated source counts as unchanged.
        fx.ok(Operation::QueueCellEvaluation { id: c2 });
        fx.ok(Operation::ApplyCellDelta {
            client_id: fx.client,
            cell_id: c2,
            delta: Delta::new().retain(4).delete(1).insert("2"),
            revision: 1,
        });
        fx.ok(Operation::ApplyCellDelta {
            client_id: fx.client,
            cell_id: c2,
            delta: Delta::new().retain(4).delete(1).insert("1"),
            revision: 2,
        });
        fx.respond(c2);
        assert_eq!(fx.validity(c2), ValidityStatus::Evaluated);

        // Errors stay aborted whatever the source did.
        fx.ok(Operation::QueueCellEvaluation { id: c1 });
        fx.ok(Operation::ApplyCellDelta {
            client_id: fx.client,
            cell_id: c1,
            delta: Delta::new().retain(5).insert(" + 1"),
            revision: 2,
        });
        fx.ok(Operation::AddCellEvaluationResponse {
            id: c1,
            result: EvaluationResult::error("boom"),
        });
        assert_eq!(fx.validity(c1), ValidityStatus::Aborted);
        fx.state.check_invariants().unwrap();
    }

    #[test]
    fn test_delta_from_unknown_client_rejected() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let c1 = fx.code_cell(s1, "");
        let stranger = ClientId::new();
        assert_eq!(
            fx.state.apply(&Operation::ApplyCellDelta {
                client_id: stranger,
                cell_id: c1,
                delta: Delta::new().insert("x"),
                revision: 0,
            }),
            Err(OperationError::UnknownClient(stranger))
        );
    }

    #[test]
    fn test_delete_section_with_branches_rejected() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        fx.section(Some(s1));
        assert_eq!(
            fx.state.apply(&Operation::DeleteSection {
                id: s1,
                delete_cells: true
            }),
            Err(OperationError::SectionHasBranches(s1))
        );
    }

    #[test]
    fn test_delete_section_moves_cells_to_previous_section() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let a = fx.code_cell(s1, "a");
        let s2 = fx.section(None);
        let b = fx.code_cell(s2, "b");
        fx.evaluate(b);

        let actions = fx.ok(Operation::DeleteSection {
            id: s2,
            delete_cells: false,
        });
        assert_eq!(actions, vec![Action::DropContainer { section_id: s2 }]);
        let section = fx.state.notebook.find_section(&s1).unwrap();
        assert_eq!(section.code_cell_ids(), vec![a, b]);
        assert_eq!(fx.validity(b), ValidityStatus::Stale);
        fx.state.check_invariants().unwrap();
    }

    #[test]
    fn test_delete_section_with_cells_bins_them() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let a = fx.code_cell(s1, "a");
        fx.ok(Operation::DeleteSection {
            id: s1,
            delete_cells: true,
        });

        assert!(fx.state.notebook.sections.is_empty());
        assert!(fx.state.cell_info(&a).is_none());
        assert!(!fx.state.cell_id_unused(&a));
        fx.state.check_invariants().unwrap();
    }

    #[test]
    fn test_restore_cell_reinserts_at_recorded_index() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let a = fx.code_cell(s1, "a");
        let b = fx.code_cell(s1, "b");
        let c = fx.code_cell(s1, "c");
        fx.evaluate(a);
        fx.evaluate(c);

        fx.ok(Operation::DeleteCell { id: b });
        assert_eq!(fx.validity(c), ValidityStatus::Stale);
        fx.evaluate(c);

        fx.ok(Operation::RestoreCell { id: b });
        let section = fx.state.notebook.find_section(&s1).unwrap();
        assert_eq!(section.code_cell_ids(), vec![a, b, c]);
        assert_eq!(fx.state.notebook.find_cell(&b).unwrap().source, "b");
        assert_eq!(fx.validity(b), ValidityStatus::Fresh);
        assert_eq!(fx.validity(c), ValidityStatus::Stale);
        assert_eq!(
            fx.state.apply(&Operation::RestoreCell { id: b }),
            Err(OperationError::NotInBin(b))
        );
    }

    #[test]
    fn test_move_cell_across_sections_forgets_old_evaluation() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let a = fx.code_cell(s1, "a");
        let s2 = fx.section(None);
        let b = fx.code_cell(s2, "b");
        fx.evaluate(a);
        fx.evaluate(b);

        let actions = fx.ok(Operation::MoveCell { id: a, offset: 1 });
        assert_eq!(
            actions,
            vec![Action::ForgetEvaluation {
                locator: Locator::new(s1, a)
            }]
        );
        assert!(fx.state.notebook.find_section(&s1).unwrap().cells.is_empty());
        assert_eq!(fx.state.notebook.find_section(&s2).unwrap().code_cell_ids(), vec![b, a]);
        assert_eq!(fx.validity(a), ValidityStatus::Stale);
    }

    #[test]
    fn test_move_cell_clamps_and_rejects_busy() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let a = fx.code_cell(s1, "a");
        let b = fx.code_cell(s1, "b");
        fx.evaluate(b);

        fx.ok(Operation::MoveCell { id: a, offset: 10 });
        assert_eq!(fx.state.notebook.find_section(&s1).unwrap().code_cell_ids(), vec![b, a]);
        // b no longer depends on a, but it lost an ancestor.
        assert_eq!(fx.validity(b), ValidityStatus::Stale);

        fx.ok(Operation::QueueCellEvaluation { id: a });
        assert_eq!(
            fx.state.apply(&Operation::MoveCell { id: a, offset: -1 }),
            Err(OperationError::CellBusy(a))
        );
    }

    #[test]
    fn test_move_section_keeps_branches_after_parents() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let s2 = fx.section(Some(s1));
        let s3 = fx.section(None);

        assert_eq!(
            fx.state.apply(&Operation::MoveSection { id: s2, offset: -1 }),
            Err(OperationError::BranchOrder)
        );
        fx.ok(Operation::MoveSection { id: s3, offset: -2 });
        let order: Vec<_> = fx.state.notebook.sections.iter().map(|s| s.id).collect();
        assert_eq!(order, vec![s3, s1, s2]);
    }

    #[test]
    fn test_set_section_parent_marks_tree_stale() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        fx.code_cell(s1, "a");
        let s2 = fx.section(None);
        let b = fx.code_cell(s2, "b");
        fx.evaluate(b);

        assert_eq!(
            fx.state.apply(&Operation::SetSectionParent {
                id: s1,
                parent_id: s2
            }),
            Err(OperationError::InvalidParent {
                section: s1,
                parent: s2
            })
        );
        fx.ok(Operation::SetSectionParent {
            id: s2,
            parent_id: s1,
        });
        assert_eq!(fx.validity(b), ValidityStatus::Stale);
        assert_eq!(fx.state.notebook.find_section(&s2).unwrap().parent_id, Some(s1));

        fx.ok(Operation::UnsetSectionParent { id: s2 });
        assert_eq!(fx.state.notebook.find_section(&s2).unwrap().parent_id, None);
    }

    #[test]
    fn test_names_reject_empty() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        assert_eq!(
            fx.state.apply(&Operation::SetNotebookName { name: "  ".into() }),
            Err(OperationError::EmptyName)
        );
        fx.ok(Operation::SetSectionName {
            id: s1,
            name: "Setup".into(),
        });
        assert_eq!(fx.state.notebook.sections[0].name, "Setup");
    }

    #[test]
    fn test_queue_section_skips_evaluated_cells() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let a = fx.code_cell(s1, "a");
        let b = fx.code_cell(s1, "b");
        let c = fx.code_cell(s1, "c");
        fx.evaluate(a);

        fx.ok(Operation::QueueSectionEvaluation { id: s1 });
        assert_eq!(fx.status(a), EvaluationStatus::Fresh);
        assert_eq!(fx.status(b), EvaluationStatus::Evaluating);
        assert_eq!(fx.status(c), EvaluationStatus::Queued);
    }

    #[test]
    fn test_reflect_failure_aborts_results() {
        let mut fx = Fixture::new();
        let s1 = fx.section(None);
        let a = fx.code_cell(s1, "a");
        let b = fx.code_cell(s1, "b");
        fx.evaluate(a);
        fx.ok(Operation::QueueCellEvaluation { id: b });

        let actions = fx.ok(Operation::ReflectEvaluationFailure { section_id: None });
        assert!(actions.is_empty());
        assert_eq!(fx.validity(a), ValidityStatus::Aborted);
        assert_eq!(fx.validity(b), ValidityStatus::Aborted);
        assert_eq!(fx.status(b), EvaluationStatus::Fresh);
        fx.state.check_invariants().unwrap();
    }

    #[test]
    fn test_client_membership() {
        let mut fx = Fixture::new();
        let client = fx.client;
        assert_eq!(
            fx.state.apply(&Operation::ClientJoin { client_id: client }),
            Err(OperationError::ClientAlreadyJoined(client))
        );
        fx.ok(Operation::ClientLeave { client_id: client });
        assert!(fx.state.clients.is_empty());
        assert_eq!(
            fx.state.apply(&Operation::ClientLeave { client_id: client }),
            Err(OperationError::UnknownClient(client))
        );
    }

    #[test]
    fn test_dirty_flag_lifecycle() {
        let mut fx = Fixture::new();
        assert!(!fx.state.dirty);
        fx.section(None);
        assert!(fx.state.dirty);
        fx.ok(Operation::MarkAsSaved);
        assert!(!fx.state.dirty);
        fx.ok(Operation::EraseOutputs);
        assert!(fx.state.dirty);
    }

    #[test]
    fn test_apply_operation_is_pure() {
        let state = NotebookState::default();
        let op = Operation::InsertSection {
            index: 0,
            id: SectionId::new(),
            parent_id: None,
        };
        let (next, actions) = apply_operation(&state, &op).unwrap();
        assert!(actions.is_empty());
        assert!(state.notebook.sections.is_empty());
        assert_eq!(next.notebook.sections.len(), 1);
    }
}
