//! Error types for the kernel.

use techo_delta::DeltaError;
use techo_types::{CellId, ClientId, SectionId};
use thiserror::Error;

/// Why an operation was rejected.
///
/// A rejected operation leaves the state untouched and is never broadcast.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("section not found: {0}")]
    SectionNotFound(SectionId),

    #[error("cell not found: {0}")]
    CellNotFound(CellId),

    #[error("section id already in use: {0}")]
    DuplicateSection(SectionId),

    #[error("cell id already in use: {0}")]
    DuplicateCell(CellId),

    #[error("index {index} out of bounds (len {len})")]
    InvalidIndex { index: usize, len: usize },

    #[error("not a code cell: {0}")]
    NotACodeCell(CellId),

    #[error("cell is evaluating or queued: {0}")]
    CellBusy(CellId),

    #[error("cell is not evaluating: {0}")]
    NotEvaluating(CellId),

    #[error("cell is neither evaluating nor queued: {0}")]
    NotQueuedOrEvaluating(CellId),

    #[error("section has branches: {0}")]
    SectionHasBranches(SectionId),

    #[error("section has evaluating or queued cells: {0}")]
    SectionBusy(SectionId),

    #[error("invalid parent {parent} for section {section}")]
    InvalidParent { section: SectionId, parent: SectionId },

    #[error("move would place a branch before its parent")]
    BranchOrder,

    #[error("name must not be empty")]
    EmptyName,

    #[error("unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("client already joined: {0}")]
    ClientAlreadyJoined(ClientId),

    #[error("not in the bin: {0}")]
    NotInBin(CellId),

    #[error("operation not permitted for this client: {0}")]
    NotPermitted(&'static str),

    #[error(transparent)]
    Delta(#[from] DeltaError),
}

/// Errors from a [`SessionHandle`](crate::session::SessionHandle).
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("operation rejected: {0}")]
    Rejected(#[from] OperationError),

    #[error("no save target configured")]
    NoSaveTarget,

    #[error("save failed: {0}")]
    Save(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("session shut down")]
    Shutdown,
}

impl SessionError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, SessionError::Shutdown)
    }
}

/// Why a [`Subscription`](crate::flows::Subscription) yielded no message.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// The subscriber fell behind and this many messages were dropped.
    /// A replica that sees this has a gap and must resync from a snapshot.
    #[error("subscription lagged; {0} messages dropped")]
    Lagged(u64),

    #[error("bus closed")]
    Closed,
}
