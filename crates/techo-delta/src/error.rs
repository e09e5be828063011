//! Error types for delta operations.

use thiserror::Error;

/// Errors that can occur while applying or rebasing a delta.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeltaError {
    /// The client claims a revision the cell has not reached yet.
    #[error("revision mismatch: client at {given}, cell at {current}")]
    RevisionMismatch { given: u64, current: u64 },

    /// The deltas needed to rebase from this revision were already pruned.
    #[error("revision {given} is no longer retained (oldest is {oldest})")]
    HistoryPruned { given: u64, oldest: u64 },

    /// The delta spans more characters than the source holds.
    #[error("delta spans {expected} chars but source has {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}
