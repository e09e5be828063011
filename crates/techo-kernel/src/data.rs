//! Notebook session state: the document plus its runtime side tables.
//!
//! ```text
//! NotebookState
//!   ├── notebook          Notebook (sections → cells)
//!   ├── section_infos     SectionId → SectionInfo  (evaluating cell, FIFO queue)
//!   ├── cell_infos        CellId    → CellInfo     (statuses, digest, revisions)
//!   ├── bin               deleted cells / sections, oldest first
//!   ├── clients           attached clients
//!   └── dirty             unsaved changes
//! ```
//!
//! Side tables are 1:1 with the document: every section has a `SectionInfo`
//! and every cell has a `CellInfo`. Markdown cells carry a `CellInfo` too so
//! their source has a revision log; their evaluation fields never move.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use techo_delta::RevisionLog;
use techo_types::{
    Cell, CellId, ClientId, EvaluationMetadata, EvaluationStatus, Locator, Notebook, Section,
    SectionId, ValidityStatus,
};

use crate::constants::DEFAULT_BIN_LIMIT;

/// Scheduling state of one section (one evaluation container).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionInfo {
    pub evaluating_cell_id: Option<CellId>,
    pub evaluation_queue: VecDeque<CellId>,
}

impl SectionInfo {
    pub fn is_idle(&self) -> bool {
        self.evaluating_cell_id.is_none()
    }

    pub fn is_busy(&self) -> bool {
        self.evaluating_cell_id.is_some() || !self.evaluation_queue.is_empty()
    }
}

/// Runtime state of one cell.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellInfo {
    pub evaluation_status: EvaluationStatus,
    pub validity_status: ValidityStatus,
    /// blake3 hex digest of the source when the last evaluation started.
    pub evaluation_digest: Option<String>,
    /// Run number of the last evaluation started; 0 before any.
    #[serde(default)]
    pub evaluation_run: u64,
    /// Metadata of the last terminal response.
    pub last_evaluation: Option<EvaluationMetadata>,
    pub revisions: RevisionLog,
}

impl CellInfo {
    /// A fresh info whose revision log tracks `clients`.
    pub fn new<'a>(clients: impl IntoIterator<Item = &'a ClientId>) -> Self {
        Self {
            revisions: RevisionLog::with_clients(clients),
            ..Default::default()
        }
    }

    pub fn source_revision(&self) -> u64 {
        self.revisions.revision()
    }

    pub fn is_busy(&self) -> bool {
        self.evaluation_status.is_busy()
    }
}

/// A deleted entry kept for restore.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BinEntry {
    Cell {
        cell: Cell,
        section_id: SectionId,
        index: usize,
    },
    Section {
        section: Section,
        index: usize,
    },
}

impl BinEntry {
    /// True when this entry holds `cell_id`, directly or inside a section.
    pub fn contains_cell(&self, cell_id: &CellId) -> bool {
        match self {
            BinEntry::Cell { cell, .. } => cell.id == *cell_id,
            BinEntry::Section { section, .. } => section.cell_index(cell_id).is_some(),
        }
    }

    pub fn contains_section(&self, section_id: &SectionId) -> bool {
        matches!(self, BinEntry::Section { section, .. } if section.id == *section_id)
    }
}

/// The full state of one open notebook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookState {
    pub notebook: Notebook,
    pub section_infos: BTreeMap<SectionId, SectionInfo>,
    pub cell_infos: BTreeMap<CellId, CellInfo>,
    pub bin: VecDeque<BinEntry>,
    pub clients: BTreeSet<ClientId>,
    pub dirty: bool,
    pub bin_limit: usize,
    /// Evaluations started so far. Never reused, even for restored cells.
    #[serde(default)]
    pub evaluation_runs: u64,
}

impl Default for NotebookState {
    fn default() -> Self {
        Self::new(Notebook::new())
    }
}

impl NotebookState {
    /// State for an existing document. Every cell starts fresh at revision 0.
    pub fn new(notebook: Notebook) -> Self {
        let section_infos = notebook
            .sections
            .iter()
            .map(|s| (s.id, SectionInfo::default()))
            .collect();
        let cell_infos = notebook
            .cells_with_section()
            .map(|(c, _)| (c.id, CellInfo::default()))
            .collect();

        Self {
            notebook,
            section_infos,
            cell_infos,
            bin: VecDeque::new(),
            clients: BTreeSet::new(),
            dirty: false,
            bin_limit: DEFAULT_BIN_LIMIT,
            evaluation_runs: 0,
        }
    }

    pub fn with_bin_limit(mut self, bin_limit: usize) -> Self {
        self.bin_limit = bin_limit;
        self.trim_bin();
        self
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn section_info(&self, id: &SectionId) -> Option<&SectionInfo> {
        self.section_infos.get(id)
    }

    pub fn cell_info(&self, id: &CellId) -> Option<&CellInfo> {
        self.cell_infos.get(id)
    }

    pub fn evaluation_status(&self, id: &CellId) -> Option<EvaluationStatus> {
        self.cell_infos.get(id).map(|i| i.evaluation_status)
    }

    pub fn validity_status(&self, id: &CellId) -> Option<ValidityStatus> {
        self.cell_infos.get(id).map(|i| i.validity_status)
    }

    /// Whether `run` is the evaluation currently running at `locator`.
    pub fn is_current_run(&self, locator: &Locator, run: u64) -> bool {
        let evaluating = self
            .section_infos
            .get(&locator.container)
            .is_some_and(|info| info.evaluating_cell_id == Some(locator.evaluation));
        evaluating
            && self
                .cell_infos
                .get(&locator.evaluation)
                .is_some_and(|info| info.evaluation_run == run)
    }

    /// Neither in the document nor in the bin.
    pub fn section_id_unused(&self, id: &SectionId) -> bool {
        self.notebook.find_section(id).is_none() && !self.bin.iter().any(|e| e.contains_section(id))
    }

    /// Neither in the document nor in the bin.
    pub fn cell_id_unused(&self, id: &CellId) -> bool {
        self.notebook.find_cell(id).is_none() && !self.bin.iter().any(|e| e.contains_cell(id))
    }

    /// Section and branch descendants with evaluating or queued cells.
    pub fn branch_tree_busy(&self, section_id: &SectionId) -> bool {
        std::iter::once(*section_id)
            .chain(self.notebook.branch_descendants(section_id))
            .any(|id| self.section_infos.get(&id).is_some_and(SectionInfo::is_busy))
    }

    // =========================================================================
    // Bin
    // =========================================================================

    pub fn push_bin(&mut self, entry: BinEntry) {
        self.bin.push_back(entry);
        self.trim_bin();
    }

    /// Remove and return the bin entry for a deleted cell.
    pub fn take_binned_cell(&mut self, id: &CellId) -> Option<(Cell, SectionId, usize)> {
        let pos = self
            .bin
            .iter()
            .position(|e| matches!(e, BinEntry::Cell { cell, .. } if cell.id == *id))?;
        match self.bin.remove(pos)? {
            BinEntry::Cell {
                cell,
                section_id,
                index,
            } => Some((cell, section_id, index)),
            BinEntry::Section { .. } => None,
        }
    }

    fn trim_bin(&mut self) {
        while self.bin.len() > self.bin_limit {
            self.bin.pop_front();
        }
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Check the structural invariants tying the side tables to the document.
    ///
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.section_infos.len() != self.notebook.sections.len() {
            return Err("section info table out of sync".into());
        }
        if self.cell_infos.len() != self.notebook.cell_count() {
            return Err("cell info table out of sync".into());
        }
        if !self.notebook.parents_precede_children() {
            return Err("branch section precedes its parent".into());
        }

        let mut scheduled = BTreeSet::new();
        for section in &self.notebook.sections {
            let info = self
                .section_infos
                .get(&section.id)
                .ok_or_else(|| format!("missing info for section {}", section.id))?;

            for cell_id in info.evaluating_cell_id.iter().chain(&info.evaluation_queue) {
                if section.cell_index(cell_id).is_none() {
                    return Err(format!("{cell_id} scheduled outside its section"));
                }
                if !scheduled.insert(*cell_id) {
                    return Err(format!("{cell_id} scheduled twice"));
                }
            }
            if let Some(id) = info
                .evaluating_cell_id
                .iter()
                .find(|id| self.evaluation_status(id) != Some(EvaluationStatus::Evaluating))
            {
                return Err(format!("{id} evaluating without status"));
            }
            if let Some(id) = info
                .evaluation_queue
                .iter()
                .find(|id| self.evaluation_status(id) != Some(EvaluationStatus::Queued))
            {
                return Err(format!("{id} queued without status"));
            }

            for cell in &section.cells {
                let info = self
                    .cell_infos
                    .get(&cell.id)
                    .ok_or_else(|| format!("missing info for cell {}", cell.id))?;
                if info.is_busy() && !scheduled.contains(&cell.id) {
                    return Err(format!("{} busy but not scheduled", cell.id));
                }
            }
        }
        Ok(())
    }
}
