//! Evaluation scenarios driven through the reducer.
//!
//! Each test builds a notebook from scratch with public operations and checks
//! the scheduling and validity state the reducer leaves behind.

use techo_delta::Delta;
use techo_kernel::{Action, NotebookState, Operation};
use techo_types::{
    CellId, CellKind, CellOutput, ClientId, EvaluationResult, EvaluationStatus, Locator,
    SectionId, ValidityStatus,
};

// ============================================================================
// Shared test setup
// ============================================================================

struct Notebook {
    state: NotebookState,
    client: ClientId,
}

impl Notebook {
    fn new() -> Self {
        let client = ClientId::new();
        let mut state = NotebookState::default();
        state
            .apply(&Operation::ClientJoin { client_id: client })
            .unwrap();
        Self { state, client }
    }

    fn apply(&mut self, op: Operation) -> Vec<Action> {
        let actions = self.state.apply(&op).unwrap();
        self.state.check_invariants().unwrap();
        actions
    }

    fn section(&mut self, parent_id: Option<SectionId>) -> SectionId {
        let id = SectionId::new();
        let index = self.state.notebook.sections.len();
        self.apply(Operation::InsertSection {
            index,
            id,
            parent_id,
        });
        id
    }

    fn cell(&mut self, section_id: SectionId, source: &str) -> CellId {
        let id = CellId::new();
        let index = self.state.notebook.find_section(&section_id).unwrap().cells.len();
        self.apply(Operation::InsertCell {
            section_id,
            index,
            kind: CellKind::Code,
            id,
        });
        let revision = self.state.cell_info(&id).unwrap().source_revision();
        self.apply(Operation::ApplyCellDelta {
            client_id: self.client,
            cell_id: id,
            delta: Delta::new().insert(source),
            revision,
        });
        id
    }

    fn queue(&mut self, id: CellId) -> Vec<Action> {
        self.apply(Operation::QueueCellEvaluation { id })
    }

    fn respond(&mut self, id: CellId) -> Vec<Action> {
        self.apply(Operation::AddCellEvaluationResponse {
            id,
            result: EvaluationResult::success(CellOutput::text("ok")),
        })
    }

    fn evaluate(&mut self, id: CellId) {
        self.queue(id);
        self.respond(id);
    }

    fn status(&self, id: CellId) -> EvaluationStatus {
        self.state.evaluation_status(&id).unwrap()
    }

    fn validity(&self, id: CellId) -> ValidityStatus {
        self.state.validity_status(&id).unwrap()
    }

    fn queue_of(&self, id: SectionId) -> Vec<CellId> {
        self.state
            .section_info(&id)
            .unwrap()
            .evaluation_queue
            .iter()
            .copied()
            .collect()
    }
}

fn started(actions: &[Action]) -> Vec<Locator> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::StartEvaluation { locator, .. } => Some(*locator),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn queue_behind_evaluating_cell_then_respond() {
    let mut nb = Notebook::new();
    let s1 = nb.section(None);
    let c1 = nb.cell(s1, "x = 1");

    let actions = nb.queue(c1);
    assert_eq!(started(&actions), vec![Locator::new(s1, c1)]);
    assert_eq!(nb.status(c1), EvaluationStatus::Evaluating);
    assert!(nb.queue_of(s1).is_empty());

    let c2 = nb.cell(s1, "x + 1");
    let actions = nb.queue(c2);
    assert!(started(&actions).is_empty());
    assert_eq!(nb.status(c2), EvaluationStatus::Queued);
    assert_eq!(nb.status(c1), EvaluationStatus::Evaluating);
    assert_eq!(nb.queue_of(s1), vec![c2]);

    let actions = nb.respond(c1);
    assert_eq!(
        actions,
        vec![Action::StartEvaluation {
            locator: Locator::new(s1, c2),
            prev_locator: Some(Locator::new(s1, c1)),
            code: "x + 1".into(),
            run: 2,
        }]
    );
    assert_eq!(nb.validity(c1), ValidityStatus::Evaluated);
    assert_eq!(nb.status(c1), EvaluationStatus::Fresh);
    assert_eq!(nb.status(c2), EvaluationStatus::Evaluating);
    assert!(nb.queue_of(s1).is_empty());
}

#[test]
fn delete_evaluating_cell_clears_queue() {
    let mut nb = Notebook::new();
    let s1 = nb.section(None);
    let c1 = nb.cell(s1, "slow()");
    let c2 = nb.cell(s1, "never_evaluated()");
    nb.queue(c1);
    nb.queue(c2);

    let actions = nb.apply(Operation::DeleteCell { id: c1 });
    assert!(actions.contains(&Action::StopEvaluation { section_id: s1 }));
    assert!(started(&actions).is_empty());

    let info = nb.state.section_info(&s1).unwrap();
    assert_eq!(info.evaluating_cell_id, None);
    assert!(info.evaluation_queue.is_empty());
    assert!(nb.state.notebook.find_cell(&c1).is_none());
    assert!(nb.state.bin.iter().any(|entry| entry.contains_cell(&c1)));

    assert_eq!(nb.status(c2), EvaluationStatus::Fresh);
    assert_eq!(nb.validity(c2), ValidityStatus::Fresh);
}

#[test]
fn delete_evaluating_cell_leaves_previously_evaluated_cell_stale() {
    let mut nb = Notebook::new();
    let s1 = nb.section(None);
    let c1 = nb.cell(s1, "a = 1");
    let c2 = nb.cell(s1, "a * 2");
    nb.evaluate(c1);
    nb.evaluate(c2);

    nb.queue(c1);
    nb.queue(c2);
    assert_eq!(nb.status(c2), EvaluationStatus::Queued);

    nb.apply(Operation::DeleteCell { id: c1 });
    assert_eq!(nb.status(c2), EvaluationStatus::Fresh);
    assert_eq!(nb.validity(c2), ValidityStatus::Stale);
}

#[test]
fn branch_continues_from_parent_section() {
    let mut nb = Notebook::new();
    let s1 = nb.section(None);
    let _c1 = nb.cell(s1, "import data");
    let c2 = nb.cell(s1, "frame = data.load()");
    let s2 = nb.section(Some(s1));
    let c3 = nb.cell(s2, "frame.describe()");

    nb.evaluate(c2);
    let actions = nb.queue(c3);
    assert_eq!(
        actions,
        vec![Action::StartEvaluation {
            locator: Locator::new(s2, c3),
            prev_locator: Some(Locator::new(s1, c2)),
            code: "frame.describe()".into(),
            run: 2,
        }]
    );
}

#[test]
fn branch_waits_for_parent_chain() {
    let mut nb = Notebook::new();
    let s1 = nb.section(None);
    let c1 = nb.cell(s1, "setup()");
    let s2 = nb.section(Some(s1));
    let c2 = nb.cell(s2, "use_setup()");

    nb.queue(c1);
    let actions = nb.queue(c2);
    assert!(started(&actions).is_empty());
    assert_eq!(nb.status(c2), EvaluationStatus::Queued);

    let actions = nb.respond(c1);
    assert_eq!(started(&actions), vec![Locator::new(s2, c2)]);
}

#[test]
fn independent_sections_evaluate_concurrently() {
    let mut nb = Notebook::new();
    let s1 = nb.section(None);
    let s2 = nb.section(None);
    let c1 = nb.cell(s1, "a()");
    let c2 = nb.cell(s2, "b()");

    nb.queue(c1);
    let actions = nb.queue(c2);
    assert_eq!(started(&actions), vec![Locator::new(s2, c2)]);
    assert_eq!(nb.status(c1), EvaluationStatus::Evaluating);
    assert_eq!(nb.status(c2), EvaluationStatus::Evaluating);
}

#[test]
fn reevaluating_upstream_cell_marks_dependents_stale() {
    let mut nb = Notebook::new();
    let s1 = nb.section(None);
    let c1 = nb.cell(s1, "n = 10");
    let c2 = nb.cell(s1, "n * n");
    let s2 = nb.section(Some(s1));
    let c3 = nb.cell(s2, "n + 1");
    let s3 = nb.section(None);
    let unrelated = nb.cell(s3, "42");

    for id in [c1, c2, c3, unrelated] {
        nb.evaluate(id);
        assert_eq!(nb.validity(id), ValidityStatus::Evaluated);
    }

    nb.evaluate(c1);
    assert_eq!(nb.validity(c1), ValidityStatus::Evaluated);
    assert_eq!(nb.validity(c2), ValidityStatus::Stale);
    assert_eq!(nb.validity(c3), ValidityStatus::Stale);
    assert_eq!(nb.validity(unrelated), ValidityStatus::Evaluated);
}

#[test]
fn moving_cell_into_parent_section_stales_its_branches() {
    let mut nb = Notebook::new();
    let s1 = nb.section(None);
    let a = nb.cell(s1, "rows = load()");
    let z = nb.cell(s1, "rows.sort()");
    let s2 = nb.section(Some(s1));
    let b = nb.cell(s2, "rows[0]");
    let s3 = nb.section(None);
    let m = nb.cell(s3, "rows = []");

    for id in [a, z, b, m] {
        nb.evaluate(id);
    }

    // Flattened order is a, z, b, m: two up lands m before z in s1.
    let actions = nb.apply(Operation::MoveCell { id: m, offset: -2 });
    assert_eq!(
        actions,
        vec![Action::ForgetEvaluation {
            locator: Locator::new(s3, m)
        }]
    );
    assert_eq!(nb.state.notebook.find_section(&s1).unwrap().code_cell_ids(), vec![a, m, z]);
    assert!(nb.state.notebook.find_section(&s3).unwrap().cells.is_empty());

    assert_eq!(nb.validity(a), ValidityStatus::Evaluated);
    assert_eq!(nb.validity(m), ValidityStatus::Stale);
    assert_eq!(nb.validity(z), ValidityStatus::Stale);
    assert_eq!(nb.validity(b), ValidityStatus::Stale);
    let chain: Vec<CellId> = nb
        .state
        .notebook
        .parent_cells_with_section(&b)
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(chain, vec![a, m, z]);

    // Re-running the branch continues from the last cell still evaluated.
    let actions = nb.queue(b);
    assert!(matches!(
        actions.as_slice(),
        [Action::StartEvaluation { prev_locator: Some(prev), .. }] if *prev == Locator::new(s1, a)
    ));
}

#[test]
fn queue_section_runs_cells_in_order() {
    let mut nb = Notebook::new();
    let s1 = nb.section(None);
    let c1 = nb.cell(s1, "1");
    let c2 = nb.cell(s1, "2");
    let c3 = nb.cell(s1, "3");

    let actions = nb.apply(Operation::QueueSectionEvaluation { id: s1 });
    assert_eq!(started(&actions), vec![Locator::new(s1, c1)]);
    assert_eq!(nb.queue_of(s1), vec![c2, c3]);

    assert_eq!(started(&nb.respond(c1)), vec![Locator::new(s1, c2)]);
    assert_eq!(started(&nb.respond(c2)), vec![Locator::new(s1, c3)]);
    assert!(started(&nb.respond(c3)).is_empty());

    for id in [c1, c2, c3] {
        assert_eq!(nb.validity(id), ValidityStatus::Evaluated);
    }
}

#[test]
fn backend_failure_leaves_terminal_statuses() {
    let mut nb = Notebook::new();
    let s1 = nb.section(None);
    let done = nb.cell(s1, "ok()");
    let running = nb.cell(s1, "hang()");
    let waiting = nb.cell(s1, "after()");
    nb.evaluate(done);
    nb.queue(running);
    nb.queue(waiting);

    nb.apply(Operation::CancelCellEvaluation { id: running });
    nb.apply(Operation::ReflectEvaluationFailure { section_id: None });

    for id in [done, running, waiting] {
        assert_eq!(nb.status(id), EvaluationStatus::Fresh);
    }
    assert_eq!(nb.validity(done), ValidityStatus::Aborted);
    assert_eq!(nb.validity(running), ValidityStatus::Aborted);
    assert_eq!(nb.validity(waiting), ValidityStatus::Fresh);
}
