//! Session event bus.
//!
//! Every accepted operation is broadcast, in order, to every subscriber.
//! Subscribers filter with NATS-style subject patterns. The buffer is
//! bounded: a subscriber that falls behind is told how many messages it lost
//! ([`FlowError::Lagged`]) instead of silently skipping them.
//!
//! # Pattern Matching
//!
//! Patterns use dot-separated tokens with wildcards:
//! - `*` matches exactly one token: `operation.*` matches `operation.delete_cell`
//! - `>` matches one or more tokens (only at end): `>` matches everything
//! - Exact match: `notice.saved` only matches `notice.saved`
//!
//! # Subjects
//!
//! | Subject                   | Payload                                  |
//! |---------------------------|------------------------------------------|
//! | `operation.<name>`        | [`SessionFlow::Operation`]               |
//! | `notice.backend_down`     | backend lost; evaluations were cancelled |
//! | `notice.container_down`   | one container lost                       |
//! | `notice.saved`            | notebook written                         |
//! | `notice.save_failed`      | write failed; notebook stays dirty       |

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use techo_types::{ClientId, SectionId};

use crate::error::FlowError;
use crate::operation::Operation;

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a pattern.
///
/// ```
/// use techo_kernel::flows::matches_pattern;
///
/// assert!(matches_pattern("operation.*", "operation.insert_cell"));
/// assert!(matches_pattern(">", "notice.saved"));
/// assert!(!matches_pattern("notice.*", "operation.insert_cell"));
/// ```
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            // `>` must be last; it swallows the remaining tokens
            ">" => return pi == pattern_tokens.len() - 1,
            "*" => {}
            token if token != subject_tokens[si] => return false,
            _ => {}
        }
        pi += 1;
        si += 1;
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

// ============================================================================
// Payloads
// ============================================================================

/// Trait for payloads that know their subject.
pub trait HasSubject {
    fn subject(&self) -> String;
}

/// Notebook-level notices for clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    BackendDown { reason: String },
    ContainerDown { section_id: SectionId, reason: String },
    Saved { path: PathBuf },
    SaveFailed { reason: String },
}

impl Notice {
    pub fn name(&self) -> &'static str {
        match self {
            Notice::BackendDown { .. } => "backend_down",
            Notice::ContainerDown { .. } => "container_down",
            Notice::Saved { .. } => "saved",
            Notice::SaveFailed { .. } => "save_failed",
        }
    }
}

/// Everything a session broadcasts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFlow {
    /// An accepted operation. `seq` increases by one per operation.
    Operation {
        seq: u64,
        /// Submitting client; `None` for session-issued operations.
        origin: Option<ClientId>,
        operation: Operation,
    },
    Notice { notice: Notice },
}

impl HasSubject for SessionFlow {
    fn subject(&self) -> String {
        match self {
            SessionFlow::Operation { operation, .. } => format!("operation.{}", operation.name()),
            SessionFlow::Notice { notice } => format!("notice.{}", notice.name()),
        }
    }
}

/// A message published to the bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    pub subject: String,
    pub payload: T,
    pub timestamp: Instant,
}

impl<T: HasSubject> FlowMessage<T> {
    pub fn new(payload: T) -> Self {
        Self {
            subject: payload.subject(),
            payload,
            timestamp: Instant::now(),
        }
    }
}

// ============================================================================
// FlowBus
// ============================================================================

/// Broadcast bus with pattern-filtered subscriptions.
#[derive(Debug)]
pub struct FlowBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<FlowMessage<T>>,
    capacity: usize,
}

/// The bus every session publishes on.
pub type SessionBus = FlowBus<SessionFlow>;

impl<T: Clone + Send + 'static> FlowBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + HasSubject + 'static> FlowBus<T> {
    /// Publish a payload. Returns the number of subscribers reached.
    pub fn publish(&self, payload: T) -> usize {
        self.tx.send(FlowMessage::new(payload)).unwrap_or(0)
    }

    /// Subscribe to messages matching a pattern.
    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + 'static> Clone for FlowBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A pattern-filtered view of a [`FlowBus`].
pub struct Subscription<T: Clone> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching message.
    ///
    /// A subscriber that fell behind gets [`FlowError::Lagged`] once, then
    /// continues with the oldest message still buffered.
    pub async fn recv(&mut self) -> Result<FlowMessage<T>, FlowError> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if matches_pattern(&self.pattern, &msg.subject) => return Ok(msg),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(FlowError::Closed),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(pattern = %self.pattern, lagged = n, "subscription lagged behind");
                    return Err(FlowError::Lagged(n));
                }
            }
        }
    }

    /// Receive the next matching message without waiting. `Ok(None)` when
    /// nothing is buffered.
    pub fn try_recv(&mut self) -> Result<Option<FlowMessage<T>>, FlowError> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if matches_pattern(&self.pattern, &msg.subject) => return Ok(Some(msg)),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => return Err(FlowError::Closed),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(pattern = %self.pattern, lagged = n, "subscription lagged behind");
                    return Err(FlowError::Lagged(n));
                }
            }
        }
    }
}

impl<T: Clone> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}
