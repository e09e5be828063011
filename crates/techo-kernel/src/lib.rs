//! # techo-kernel
//!
//! Notebook state engine for collaborative editing and evaluation.
//!
//! The kernel owns one [`NotebookState`] per open notebook and changes it
//! only by applying [`Operation`]s:
//! - The reducer applies an operation atomically or rejects it
//! - The scheduler decides which queued cells may start evaluating
//! - Every accepted operation is broadcast, in order, on the session bus
//! - Side effects on the execution backend are returned as [`Action`]s
//!
//! A [`Session`] task serializes all of this behind a cloneable
//! [`SessionHandle`].

pub mod backend;
pub mod config;
pub mod constants;
pub mod data;
pub mod error;
pub mod export;
pub mod flows;
pub mod operation;
pub mod reducer;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use backend::{
    BackendCall, BackendEvent, BackendSink, EvaluationOptions, EvaluationRequest, ExecutionBackend,
    NullBackend, RecordingBackend,
};
pub use config::{ConfigError, SessionConfig};
pub use data::{BinEntry, CellInfo, NotebookState, SectionInfo};
pub use error::{FlowError, OperationError, SessionError};
pub use export::{Exporter, JsonExporter, write_export};
pub use flows::{
    FlowBus, FlowMessage, HasSubject, Notice, SessionBus, SessionFlow, Subscription,
    matches_pattern,
};
pub use operation::{Action, Operation};
pub use reducer::apply_operation;
pub use registry::SessionRegistry;
pub use session::{JoinReply, ResyncReply, Session, SessionHandle, SessionSummary};

/// Result type for reducer operations.
pub type Result<T> = std::result::Result<T, OperationError>;
