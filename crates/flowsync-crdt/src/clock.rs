//! Logical clocks
//!
//! - [`OpId`]: identity of one change (`actor`, `seq`)
//! - [`Stamp`]: total order over individual writes, used to pick the visible
//!   value among concurrent ones
//! - [`CausalContext`]: the set of changes a replica has applied, as a
//!   version vector

use crdts::{CmRDT, CvRDT, Dot, VClock};
use flowsync_model::ReplicaId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Identity of a change: the authoring replica and its per-replica sequence
/// number (starting at 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    /// Authoring replica
    pub actor: ReplicaId,
    /// Position in the author's sequence
    pub seq: u64,
}

impl OpId {
    /// Identity of change `seq` from `actor`
    #[inline]
    #[must_use]
    pub const fn new(actor: ReplicaId, seq: u64) -> Self {
        Self { actor, seq }
    }

    #[inline]
    fn dot(self) -> Dot<ReplicaId> {
        Dot::new(self.actor, self.seq)
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.seq, self.actor)
    }
}

/// Total order over writes
///
/// Compared field by field: Lamport time first, then the authoring replica,
/// then the position of the operation inside its change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Lamport time of the change
    pub lamport: u64,
    /// Authoring replica
    pub actor: ReplicaId,
    /// Position of the operation inside its change
    pub index: u32,
}

/// Version vector over replicas
///
/// Changes are applied in causal order, so the set of applied changes from
/// each actor is always a prefix `1..=n` and one counter per actor describes
/// it exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CausalContext(VClock<ReplicaId>);

impl CausalContext {
    /// Context that has seen nothing
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(VClock::new())
    }

    /// Highest contiguous sequence number seen from `actor`
    #[inline]
    #[must_use]
    pub fn seq(&self, actor: &ReplicaId) -> u64 {
        self.0.get(actor)
    }

    /// Whether the change `id` is part of this context
    #[inline]
    #[must_use]
    pub fn contains(&self, id: OpId) -> bool {
        self.seq(&id.actor) >= id.seq
    }

    /// Whether every change in `other` is also in `self`
    #[must_use]
    pub fn includes(&self, other: &Self) -> bool {
        other
            .0
            .dots
            .iter()
            .all(|(actor, seq)| self.seq(actor) >= *seq)
    }

    /// Record that change `id` was applied
    #[inline]
    pub fn observe(&mut self, id: OpId) {
        self.0.apply(id.dot());
    }

    /// Pointwise maximum
    #[inline]
    pub fn merge(&mut self, other: Self) {
        self.0.merge(other.0);
    }

    /// Iterate over `(actor, seq)` entries
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.0.dots.iter().map(|(a, s)| (a, *s))
    }

    /// Total number of changes described
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.dots.values().sum()
    }

    /// Whether no change has been seen
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.dots.is_empty()
    }
}

impl PartialOrd for CausalContext {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.includes(other), other.includes(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}
