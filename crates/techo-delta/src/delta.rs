//! Text deltas: retain / insert / delete sequences over a cell source.
//!
//! Lengths count Unicode scalar values (`char`s), not bytes, so a delta means
//! the same thing to every client regardless of how it encodes text.
//!
//! A delta does not have to span the whole source: anything past its last op
//! is implicitly retained. Deltas are kept normalized:
//! - no zero-length ops
//! - adjacent ops of the same kind are merged
//! - an insert adjacent to a delete sorts before it
//! - no trailing retain

use serde::{Deserialize, Serialize};

use crate::{DeltaError, Result};

/// A single delta component.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOp {
    /// Keep the next `n` chars.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Drop the next `n` chars.
    Delete(usize),
}

impl DeltaOp {
    /// Length in chars.
    pub fn len(&self) -> usize {
        match self {
            DeltaOp::Retain(n) | DeltaOp::Delete(n) => *n,
            DeltaOp::Insert(text) => text.chars().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, DeltaOp::Insert(_))
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, DeltaOp::Delete(_))
    }
}

/// Which side wins when two deltas insert at the same position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// The delta that is already applied inserts first.
    Left,
    /// The delta being transformed inserts first.
    Right,
}

/// A normalized sequence of [`DeltaOp`]s.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<DeltaOp>", into = "Vec<DeltaOp>")]
pub struct Delta {
    ops: Vec<DeltaOp>,
}

impl From<Vec<DeltaOp>> for Delta {
    fn from(ops: Vec<DeltaOp>) -> Self {
        let mut delta = Delta::new();
        for op in ops {
            delta.push(op);
        }
        delta.chop();
        delta
    }
}

impl From<Delta> for Vec<DeltaOp> {
    fn from(delta: Delta) -> Self {
        delta.ops
    }
}

impl Delta {
    /// The identity delta.
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    // =========================================================================
    // Building
    // =========================================================================

    pub fn retain(mut self, n: usize) -> Self {
        self.push(DeltaOp::Retain(n));
        self
    }

    pub fn insert(mut self, text: impl Into<String>) -> Self {
        self.push(DeltaOp::Insert(text.into()));
        self
    }

    pub fn delete(mut self, n: usize) -> Self {
        self.push(DeltaOp::Delete(n));
        self
    }

    /// Append an op, keeping the delta normalized (except for a trailing
    /// retain, which [`Delta::chop`] removes).
    pub fn push(&mut self, op: DeltaOp) {
        if op.is_empty() {
            return;
        }

        match op {
            DeltaOp::Retain(n) => {
                if let Some(DeltaOp::Retain(last)) = self.ops.last_mut() {
                    *last += n;
                    return;
                }
                self.ops.push(DeltaOp::Retain(n));
            }
            DeltaOp::Delete(n) => {
                if let Some(DeltaOp::Delete(last)) = self.ops.last_mut() {
                    *last += n;
                    return;
                }
                self.ops.push(DeltaOp::Delete(n));
            }
            DeltaOp::Insert(text) => {
                // Inserts sort before an adjacent delete.
                let at = match self.ops.last() {
                    Some(DeltaOp::Delete(_)) => self.ops.len() - 1,
                    _ => self.ops.len(),
                };
                match at.checked_sub(1).and_then(|i| self.ops.get_mut(i)) {
                    Some(DeltaOp::Insert(prev)) => prev.push_str(&text),
                    _ => self.ops.insert(at, DeltaOp::Insert(text)),
                }
            }
        }
    }

    /// Drop a trailing retain; it is implied.
    pub fn chop(&mut self) {
        if let Some(DeltaOp::Retain(_)) = self.ops.last() {
            self.ops.pop();
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn ops(&self) -> &[DeltaOp] {
        &self.ops
    }

    /// True for the identity delta.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Chars of the source this delta spans.
    pub fn base_len(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| !op.is_insert())
            .map(DeltaOp::len)
            .sum()
    }

    /// Net change in length when applied.
    pub fn len_change(&self) -> isize {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Retain(_) => 0,
                DeltaOp::Insert(text) => text.chars().count() as isize,
                DeltaOp::Delete(n) => -(*n as isize),
            })
            .sum()
    }

    // =========================================================================
    // Algebra
    // =========================================================================

    /// Apply to `text`, producing the new text.
    pub fn apply(&self, text: &str) -> Result<String> {
        let actual = text.chars().count();
        let expected = self.base_len();
        if expected > actual {
            return Err(DeltaError::LengthMismatch { expected, actual });
        }

        let mut chars = text.chars();
        let mut out = String::with_capacity(text.len());
        for op in &self.ops {
            match op {
                DeltaOp::Retain(n) => out.extend(chars.by_ref().take(*n)),
                DeltaOp::Insert(s) => out.push_str(s),
                DeltaOp::Delete(n) => chars.by_ref().take(*n).for_each(drop),
            }
        }
        out.extend(chars);
        Ok(out)
    }

    /// A single delta equivalent to applying `self` then `other`.
    pub fn compose(&self, other: &Delta) -> Delta {
        let mut this = OpCursor::new(&self.ops);
        let mut next = OpCursor::new(&other.ops);
        let mut result = Delta::new();

        while this.has_next() || next.has_next() {
            if next.peek_is_insert() {
                result.push(next.next_all());
            } else if this.peek_is_delete() {
                result.push(this.next_all());
            } else {
                let len = this.peek_len().min(next.peek_len());
                let this_op = this.next(len);
                let next_op = next.next(len);
                match next_op {
                    DeltaOp::Retain(_) => result.push(this_op),
                    DeltaOp::Delete(n) => {
                        // Deleting freshly inserted text cancels out.
                        if let DeltaOp::Retain(_) = this_op {
                            result.push(DeltaOp::Delete(n));
                        }
                    }
                    DeltaOp::Insert(_) => unreachable!("inserts are consumed above"),
                }
            }
        }

        result.chop();
        result
    }

    /// Rewrite `other` so it applies after `self`, both having been written
    /// against the same source.
    ///
    /// `priority` decides whose insertion comes first when both insert at
    /// the same position.
    pub fn transform(&self, other: &Delta, priority: Priority) -> Delta {
        let mut applied = OpCursor::new(&self.ops);
        let mut incoming = OpCursor::new(&other.ops);
        let mut result = Delta::new();

        while applied.has_next() || incoming.has_next() {
            if applied.peek_is_insert()
                && (priority == Priority::Left || !incoming.peek_is_insert())
            {
                let skipped = applied.next_all().len();
                result.push(DeltaOp::Retain(skipped));
            } else if incoming.peek_is_insert() {
                result.push(incoming.next_all());
            } else {
                let len = applied.peek_len().min(incoming.peek_len());
                let applied_op = applied.next(len);
                let incoming_op = incoming.next(len);
                match (applied_op, incoming_op) {
                    // Already deleted; nothing left for the incoming op to touch.
                    (DeltaOp::Delete(_), _) => {}
                    (_, DeltaOp::Delete(n)) => result.push(DeltaOp::Delete(n)),
                    _ => result.push(DeltaOp::Retain(len)),
                }
            }
        }

        result.chop();
        result
    }
}

/// Cursor over ops that can split an op across calls.
///
/// Past the end it behaves like an infinite retain.
struct OpCursor<'a> {
    ops: &'a [DeltaOp],
    index: usize,
    offset: usize,
}

impl<'a> OpCursor<'a> {
    fn new(ops: &'a [DeltaOp]) -> Self {
        Self {
            ops,
            index: 0,
            offset: 0,
        }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    fn peek_len(&self) -> usize {
        match self.ops.get(self.index) {
            Some(op) => op.len() - self.offset,
            None => usize::MAX,
        }
    }

    fn peek_is_insert(&self) -> bool {
        self.ops.get(self.index).is_some_and(DeltaOp::is_insert)
    }

    fn peek_is_delete(&self) -> bool {
        self.ops.get(self.index).is_some_and(DeltaOp::is_delete)
    }

    fn next(&mut self, len: usize) -> DeltaOp {
        let Some(op) = self.ops.get(self.index) else {
            return DeltaOp::Retain(len);
        };

        let offset = self.offset;
        let remaining = op.len() - offset;
        let take = len.min(remaining);
        if take == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += take;
        }

        match op {
            DeltaOp::Retain(_) => DeltaOp::Retain(take),
            DeltaOp::Delete(_) => DeltaOp::Delete(take),
            DeltaOp::Insert(text) => DeltaOp::Insert(text.chars().skip(offset).take(take).collect()),
        }
    }

    fn next_all(&mut self) -> DeltaOp {
        self.next(usize::MAX)
    }
}

// ============================================================================
// Tests
// ============================================================================
