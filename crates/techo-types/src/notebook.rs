//! The notebook document: ordered sections of cells.
//!
//! Pure data plus read-only queries. Nothing here mutates evaluation state;
//! the reducer in `techo-kernel` is the only writer.
//!
//! # Dependency chain
//!
//! Each section is its own evaluation container. A section whose `parent_id`
//! is set branches out of its parent: its container continues from the
//! parent's latest evaluation, with the branch point at the end of the
//! parent section. The chain of a code cell, oldest first, is therefore:
//!
//! ```text
//! code cells of the root ancestor section
//!   ...
//! code cells of the parent section
//! preceding code cells of the cell's own section
//! ```
//!
//! Chains are recomputed on every query; the tree mutates with every
//! structural operation and a cached graph would have to follow it.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::{CellId, SectionId};

/// Default notebook name.
pub const DEFAULT_NOTEBOOK_NAME: &str = "Untitled notebook";

/// Default section name.
pub const DEFAULT_SECTION_NAME: &str = "Section";

/// Kind of a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum CellKind {
    /// Prose; never evaluated.
    #[default]
    #[strum(serialize = "markdown", serialize = "md")]
    Markdown,
    /// Evaluated in its section's container.
    Code,
}

impl CellKind {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CellKind::Markdown => "markdown",
            CellKind::Code => "code",
        }
    }
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One output produced by evaluating a cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellOutput {
    /// Captured standard output.
    Stdout { text: String },
    /// Plain text rendering of a result value.
    Text { text: String },
    /// Markdown rendering of a result value.
    Markdown { text: String },
    /// Structured result value.
    Json { value: serde_json::Value },
    /// Evaluation error.
    Error { message: String },
}

impl CellOutput {
    /// Convenience constructor for plain text.
    pub fn text(text: impl Into<String>) -> Self {
        CellOutput::Text { text: text.into() }
    }

    /// Convenience constructor for captured stdout.
    pub fn stdout(text: impl Into<String>) -> Self {
        CellOutput::Stdout { text: text.into() }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CellOutput::Error { .. })
    }
}

/// A cell. Identity is immutable; `source` only changes through deltas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub kind: CellKind,
    pub source: String,
    #[serde(default)]
    pub outputs: Vec<CellOutput>,
}

impl Cell {
    /// A new empty cell.
    pub fn new(id: CellId, kind: CellKind) -> Self {
        Self {
            id,
            kind,
            source: String::new(),
            outputs: Vec::new(),
        }
    }

    pub fn is_code(&self) -> bool {
        self.kind == CellKind::Code
    }
}

/// A section: an ordered run of cells sharing one evaluation container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: SectionId,
    pub name: String,
    #[serde(default)]
    pub cells: Vec<Cell>,
    /// Set when this section branches out of another section.
    #[serde(default)]
    pub parent_id: Option<SectionId>,
}

impl Section {
    /// A new empty, non-branching section.
    pub fn new(id: SectionId) -> Self {
        Self {
            id,
            name: DEFAULT_SECTION_NAME.to_string(),
            cells: Vec::new(),
            parent_id: None,
        }
    }

    pub fn is_branching(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Index of a cell within this section.
    pub fn cell_index(&self, cell_id: &CellId) -> Option<usize> {
        self.cells.iter().position(|c| c.id == *cell_id)
    }

    /// Ids of the code cells, in order.
    pub fn code_cell_ids(&self) -> Vec<CellId> {
        self.cells.iter().filter(|c| c.is_code()).map(|c| c.id).collect()
    }
}

/// The canonical document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    pub name: String,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl Default for Notebook {
    fn default() -> Self {
        Self::new()
    }
}

impl Notebook {
    /// An empty notebook with the default name.
    pub fn new() -> Self {
        Self {
            name: DEFAULT_NOTEBOOK_NAME.to_string(),
            sections: Vec::new(),
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn find_section(&self, id: &SectionId) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == *id)
    }

    pub fn find_section_mut(&mut self, id: &SectionId) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.id == *id)
    }

    pub fn section_index(&self, id: &SectionId) -> Option<usize> {
        self.sections.iter().position(|s| s.id == *id)
    }

    pub fn find_cell(&self, id: &CellId) -> Option<&Cell> {
        self.find_cell_with_section(id).map(|(cell, _)| cell)
    }

    pub fn find_cell_mut(&mut self, id: &CellId) -> Option<&mut Cell> {
        self.sections
            .iter_mut()
            .flat_map(|s| s.cells.iter_mut())
            .find(|c| c.id == *id)
    }

    /// A cell together with the section that owns it.
    pub fn find_cell_with_section(&self, id: &CellId) -> Option<(&Cell, &Section)> {
        self.sections.iter().find_map(|section| {
            section
                .cells
                .iter()
                .find(|c| c.id == *id)
                .map(|cell| (cell, section))
        })
    }

    /// `(section index, cell index)` of a cell.
    pub fn cell_position(&self, id: &CellId) -> Option<(usize, usize)> {
        self.sections
            .iter()
            .enumerate()
            .find_map(|(si, s)| s.cell_index(id).map(|ci| (si, ci)))
    }

    /// All cells paired with their section id, in document order.
    pub fn cells_with_section(&self) -> impl Iterator<Item = (&Cell, SectionId)> + '_ {
        self.sections
            .iter()
            .flat_map(|s| s.cells.iter().map(move |c| (c, s.id)))
    }

    pub fn cell_count(&self) -> usize {
        self.sections.iter().map(|s| s.cells.len()).sum()
    }

    /// Total size of all cell sources in bytes.
    pub fn source_bytes(&self) -> usize {
        self.cells_with_section().map(|(c, _)| c.source.len()).sum()
    }

    // =========================================================================
    // Branch graph
    // =========================================================================

    /// Sections whose parent is `id`, in document order.
    pub fn child_sections(&self, id: &SectionId) -> Vec<SectionId> {
        self.sections
            .iter()
            .filter(|s| s.parent_id.as_ref() == Some(id))
            .map(|s| s.id)
            .collect()
    }

    /// Sections branching from `id` directly or transitively, in document order.
    pub fn branch_descendants(&self, id: &SectionId) -> Vec<SectionId> {
        self.sections
            .iter()
            .filter(|s| s.id != *id && self.section_lineage(&s.id).contains(id))
            .map(|s| s.id)
            .collect()
    }

    /// The parent chain of a section, root first, ending with the section
    /// itself. Empty if the section does not exist.
    ///
    /// A malformed cycle is cut at the first repeated section.
    pub fn section_lineage(&self, id: &SectionId) -> Vec<SectionId> {
        let mut lineage = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.find_section(id);

        while let Some(section) = current {
            if !seen.insert(section.id) {
                break;
            }
            lineage.push(section.id);
            current = section.parent_id.as_ref().and_then(|p| self.find_section(p));
        }

        lineage.reverse();
        lineage
    }

    /// Every branched section appears after its parent.
    pub fn parents_precede_children(&self) -> bool {
        self.sections.iter().enumerate().all(|(idx, s)| match &s.parent_id {
            None => true,
            Some(parent) => matches!(self.section_index(parent), Some(p) if p < idx),
        })
    }

    // =========================================================================
    // Dependency chain
    // =========================================================================

    /// Every code cell that must have evaluated for `cell_id`'s evaluation to
    /// be meaningful, oldest first, paired with its section.
    ///
    /// Empty for unknown cells.
    pub fn parent_cells_with_section(&self, cell_id: &CellId) -> Vec<(CellId, SectionId)> {
        let Some((section_idx, cell_idx)) = self.cell_position(cell_id) else {
            return Vec::new();
        };
        let section = &self.sections[section_idx];

        let mut chain = Vec::new();
        let lineage = self.section_lineage(&section.id);
        for ancestor_id in &lineage[..lineage.len().saturating_sub(1)] {
            if let Some(ancestor) = self.find_section(ancestor_id) {
                chain.extend(ancestor.code_cell_ids().into_iter().map(|c| (c, ancestor.id)));
            }
        }
        chain.extend(
            section.cells[..cell_idx]
                .iter()
                .filter(|c| c.is_code())
                .map(|c| (c.id, section.id)),
        );
        chain
    }

    /// Code cells whose chain contains `cell_id`, in document order.
    pub fn child_cells(&self, cell_id: &CellId) -> Vec<CellId> {
        let Some((section_idx, cell_idx)) = self.cell_position(cell_id) else {
            return Vec::new();
        };
        let section = &self.sections[section_idx];

        let mut children: Vec<CellId> = section.cells[cell_idx + 1..]
            .iter()
            .filter(|c| c.is_code())
            .map(|c| c.id)
            .collect();
        for branch_id in self.branch_descendants(&section.id) {
            if let Some(branch) = self.find_section(&branch_id) {
                children.extend(branch.code_cell_ids());
            }
        }
        children
    }

    /// Code cells of a section and of every section branching from it.
    pub fn cells_in_branch_tree(&self, section_id: &SectionId) -> Vec<CellId> {
        let mut ids = Vec::new();
        if let Some(section) = self.find_section(section_id) {
            ids.extend(section.code_cell_ids());
        }
        for branch_id in self.branch_descendants(section_id) {
            if let Some(branch) = self.find_section(&branch_id) {
                ids.extend(branch.code_cell_ids());
            }
        }
        ids
    }
}

// ============================================================================
// Tests
// ============================================================================
