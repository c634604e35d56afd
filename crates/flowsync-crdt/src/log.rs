//! Causally ordered change log
//!
//! [`ChangeLog`] accepts changes in any order and releases them in causal
//! order. A change is released once every change in its dependencies has
//! been released; until then it waits in a pending buffer. Duplicates are
//! recognised and dropped, which makes delivery at-least-once safe.

use crate::change::Change;
use crate::clock::{CausalContext, OpId};
use crate::error::MergeError;
use std::collections::BTreeMap;
use tracing::trace;

/// Result of offering a change to the log
#[derive(Debug, Clone, PartialEq)]
pub enum Offer {
    /// Already released or already pending
    Duplicate,
    /// Waiting for missing dependencies
    Buffered,
    /// Released changes, in causal order; the offered change comes first
    Ready(Vec<Change>),
}

/// Log of released changes plus a buffer of early arrivals
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    context: CausalContext,
    history: Vec<Change>,
    pending: BTreeMap<OpId, Change>,
}

impl ChangeLog {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a change
    ///
    /// # Errors
    /// Returns error if the change is malformed
    pub fn offer(&mut self, change: Change) -> Result<Offer, MergeError> {
        change.validate()?;

        let id = change.id();
        if self.context.contains(id) || self.pending.contains_key(&id) {
            return Ok(Offer::Duplicate);
        }
        if !self.is_ready(&change) {
            trace!(change = %id, "buffering change with missing dependencies");
            self.pending.insert(id, change);
            return Ok(Offer::Buffered);
        }

        let mut released = vec![self.release(change)];
        while let Some(next) = self
            .pending
            .values()
            .find(|c| self.is_ready(c))
            .map(Change::id)
        {
            if let Some(change) = self.pending.remove(&next) {
                released.push(self.release(change));
            }
        }
        Ok(Offer::Ready(released))
    }

    fn is_ready(&self, change: &Change) -> bool {
        let id = change.id();
        self.context.seq(&id.actor) + 1 == id.seq && self.context.includes(change.deps())
    }

    fn release(&mut self, change: Change) -> Change {
        self.context.observe(change.id());
        self.history.push(change.clone());
        change
    }

    /// Released changes not described by `context`, in causal order
    ///
    /// Scans the whole history, which is never compacted; a relay answering
    /// every heartbeat pays for this once per `Hello`.
    #[must_use]
    pub fn since(&self, context: &CausalContext) -> Vec<Change> {
        self.history
            .iter()
            .filter(|c| !context.contains(c.id()))
            .cloned()
            .collect()
    }

    /// Causal context of all released changes
    #[inline]
    #[must_use]
    pub fn context(&self) -> &CausalContext {
        &self.context
    }

    /// Number of released changes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Whether nothing has been released
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Number of changes waiting for dependencies
    #[inline]
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
