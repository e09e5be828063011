//! Per-cell revision log.
//!
//! Each cell source carries a revision counter and the deltas applied since
//! the oldest revision some attached client may still be writing against.
//! Incoming deltas written against an older revision are rebased over every
//! logged delta after it before being applied.
//!
//! ```text
//! revision:   0 ──d1──▶ 1 ──d2──▶ 2 ──d3──▶ 3
//!                                  ▲
//!                     client writes d' against 2
//!                     applied as transform(d3, d')
//! ```
//!
//! Entries are pruned once every registered client has acknowledged a
//! revision past them.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use techo_types::ClientId;
use tracing::trace;

use crate::delta::{Delta, Priority};
use crate::{DeltaError, Result};

/// A delta as it was applied, rebased onto the revision before `revision`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedDelta {
    /// Revision the source reached by applying this delta.
    pub revision: u64,
    pub author: ClientId,
    pub delta: Delta,
}

/// Outcome of [`RevisionLog::apply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub source: String,
    pub revision: u64,
    /// The delta as rebased onto the previous revision.
    pub delta: Delta,
}

/// Revision counter, retained deltas and client acknowledgements for one cell.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionLog {
    revision: u64,
    deltas: VecDeque<LoggedDelta>,
    acknowledged: BTreeMap<ClientId, u64>,
}

impl RevisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log seeded for the given clients, all at revision 0.
    pub fn with_clients<'a>(clients: impl IntoIterator<Item = &'a ClientId>) -> Self {
        let mut log = Self::new();
        for client in clients {
            log.register_client(*client);
        }
        log
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Oldest revision a delta may still be written against.
    pub fn oldest_revision(&self) -> u64 {
        self.deltas
            .front()
            .map(|d| d.revision - 1)
            .unwrap_or(self.revision)
    }

    pub fn retained(&self) -> impl Iterator<Item = &LoggedDelta> {
        self.deltas.iter()
    }

    pub fn acknowledged(&self, client: &ClientId) -> Option<u64> {
        self.acknowledged.get(client).copied()
    }

    // =========================================================================
    // Editing
    // =========================================================================

    /// Apply `delta`, written by `author` against `base_revision`, to `source`.
    ///
    /// Insert ties against logged deltas go to the lower client id, so the
    /// result does not depend on the order concurrent deltas arrive in.
    pub fn apply(
        &mut self,
        source: &str,
        delta: &Delta,
        base_revision: u64,
        author: ClientId,
    ) -> Result<Applied> {
        if base_revision > self.revision {
            return Err(DeltaError::RevisionMismatch {
                given: base_revision,
                current: self.revision,
            });
        }
        let oldest = self.oldest_revision();
        if base_revision < oldest {
            return Err(DeltaError::HistoryPruned {
                given: base_revision,
                oldest,
            });
        }

        let mut rebased = delta.clone();
        for logged in self.deltas.iter().filter(|d| d.revision > base_revision) {
            let priority = if logged.author <= author {
                Priority::Left
            } else {
                Priority::Right
            };
            rebased = logged.delta.transform(&rebased, priority);
        }

        let new_source = rebased.apply(source)?;
        self.revision += 1;
        trace!(
            revision = self.revision,
            base_revision,
            author = %author,
            "delta applied"
        );

        self.deltas.push_back(LoggedDelta {
            revision: self.revision,
            author,
            delta: rebased.clone(),
        });
        self.acknowledged.insert(author, self.revision);
        self.prune();

        Ok(Applied {
            source: new_source,
            revision: self.revision,
            delta: rebased,
        })
    }

    // =========================================================================
    // Acknowledgement
    // =========================================================================

    /// Record that `client` has seen `revision`. Acknowledgements never move
    /// backwards.
    pub fn report_revision(&mut self, client: ClientId, revision: u64) -> Result<()> {
        if revision > self.revision {
            return Err(DeltaError::RevisionMismatch {
                given: revision,
                current: self.revision,
            });
        }
        let acked = self.acknowledged.entry(client).or_insert(revision);
        *acked = (*acked).max(revision);
        self.prune();
        Ok(())
    }

    /// A newly attached client starts from the current revision.
    pub fn register_client(&mut self, client: ClientId) {
        self.acknowledged.insert(client, self.revision);
    }

    pub fn forget_client(&mut self, client: &ClientId) {
        self.acknowledged.remove(client);
        self.prune();
    }

    /// Drop deltas every registered client has already seen.
    pub fn prune(&mut self) {
        let floor = self
            .acknowledged
            .values()
            .copied()
            .min()
            .unwrap_or(self.revision);
        while self.deltas.front().is_some_and(|d| d.revision <= floor) {
            self.deltas.pop_front();
        }
    }
}
