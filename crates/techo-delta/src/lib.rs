//! Delta engine for collaborative cell editing.
//!
//! - [`Delta`]: retain / insert / delete sequences with `apply`, `compose`
//!   and `transform`
//! - [`RevisionLog`]: per-cell revision counter, retained deltas, and per-client
//!   acknowledgements used to rebase stale deltas and prune history
//!
//! # Example
//!
//! ```
//! use techo_delta::{Delta, RevisionLog};
//! use techo_types::ClientId;
//!
//! let alice = ClientId::new();
//! let mut log = RevisionLog::with_clients([&alice]);
//!
//! let applied = log
//!     .apply("print(1)", &Delta::new().retain(6).delete(1).insert("2"), 0, alice)
//!     .unwrap();
//! assert_eq!(applied.source, "print(2)");
//! assert_eq!(applied.revision, 1);
//! ```

pub mod delta;
pub mod error;
pub mod history;

pub use delta::{Delta, DeltaOp, Priority};
pub use error::DeltaError;
pub use history::{Applied, LoggedDelta, RevisionLog};

/// Result type for delta operations.
pub type Result<T> = std::result::Result<T, DeltaError>;
