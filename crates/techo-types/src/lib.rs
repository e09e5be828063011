//! Shared identity and document types for Techo.
//!
//! This crate is the leaf of the workspace: typed ids, the notebook document
//! model, and the evaluation vocabulary. It has **no internal techo
//! dependencies**.
//!
//! # Entity Overview
//!
//! ```text
//! Session (SessionId) ← one open notebook, one authoritative writer
//!     └── owns Notebook
//!           └── Section (SectionId) ← one evaluation container
//!                 └── parent_id: branch out of another section
//!                 └── Cell (CellId) ← markdown or code
//!     └── attached Client (ClientId)
//! ```
//!
//! # Key Types
//!
//! |--------------------|----------------------------------------------|
//! | Type               | Purpose                                      |
//! |--------------------|----------------------------------------------|
//! | [`Notebook`]       | Ordered sections + name                      |
//! | [`Section`]        | Ordered cells + optional branch parent       |
//! | [`Cell`]           | Source + outputs                             |
//! | [`Locator`]        | (container, evaluation) address              |
//! | [`EvaluationStatus`] | fresh / evaluating / queued                |
//! | [`ValidityStatus`] | fresh / evaluated / stale / aborted          |
//! |--------------------|----------------------------------------------|

pub mod evaluation;
pub mod ids;
pub mod notebook;

pub use evaluation::{
    EvaluationMetadata, EvaluationResult, EvaluationStatus, Locator, ValidityStatus,
};
pub use ids::{CellId, ClientId, SectionId, SessionId};
pub use notebook::{
    Cell, CellKind, CellOutput, DEFAULT_NOTEBOOK_NAME, DEFAULT_SECTION_NAME, Notebook, Section,
};
