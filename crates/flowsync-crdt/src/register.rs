//! Multi-value register

use crate::clock::{CausalContext, OpId, Stamp};

#[derive(Debug, Clone, PartialEq)]
struct Sibling<V> {
    origin: OpId,
    stamp: Stamp,
    value: V,
}

/// Register keeping every concurrent value
///
/// A write removes the siblings it causally follows: those whose change is
/// in the writer's context, and earlier writes of the same change. Whatever
/// is left is concurrent with the write and stays. Siblings are kept sorted
/// by [`Stamp`], so the visible value is always the last one.
#[derive(Debug, Clone, PartialEq)]
pub struct MvRegister<V> {
    siblings: Vec<Sibling<V>>,
}

impl<V> Default for MvRegister<V> {
    fn default() -> Self {
        Self {
            siblings: Vec::new(),
        }
    }
}

impl<V> MvRegister<V> {
    /// Register with no value
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write made by change `origin` with the given causal context
    pub fn write(&mut self, origin: OpId, stamp: Stamp, deps: &CausalContext, value: V) {
        self.siblings.retain(|s| {
            let seen = deps.contains(s.origin);
            let earlier_in_same_change = s.origin == origin && s.stamp.index < stamp.index;
            !(seen || earlier_in_same_change)
        });
        if self.siblings.iter().any(|s| s.stamp == stamp) {
            return;
        }
        let pos = self.siblings.partition_point(|s| s.stamp < stamp);
        self.siblings.insert(
            pos,
            Sibling {
                origin,
                stamp,
                value,
            },
        );
    }

    /// Visible value
    #[inline]
    #[must_use]
    pub fn value(&self) -> Option<&V> {
        self.siblings.last().map(|s| &s.value)
    }

    /// Stamp of the visible value
    #[inline]
    #[must_use]
    pub fn stamp(&self) -> Option<Stamp> {
        self.siblings.last().map(|s| s.stamp)
    }

    /// All concurrent values, lowest stamp first
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.siblings.iter().map(|s| &s.value)
    }

    /// Whether more than one concurrent value exists
    #[inline]
    #[must_use]
    pub fn is_conflicted(&self) -> bool {
        self.siblings.len() > 1
    }

    /// Whether nothing was ever written
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.siblings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_model::ReplicaId;

    fn actor(n: u128) -> ReplicaId {
        ReplicaId::from_u128(n)
    }

    fn stamp(lamport: u64, a: u128, index: u32) -> Stamp {
        Stamp {
            lamport,
            actor: actor(a),
            index,
        }
    }

    #[test]
    fn causal_write_replaces() {
        let mut reg = MvRegister::new();
        let first = OpId::new(actor(1), 1);
        reg.write(first, stamp(1, 1, 0), &CausalContext::new(), "a");

        let mut deps = CausalContext::new();
        deps.observe(first);
        reg.write(OpId::new(actor(2), 1), stamp(2, 2, 0), &deps, "b");

        assert_eq!(reg.value(), Some(&"b"));
        assert!(!reg.is_conflicted());
    }

    #[test]
    fn concurrent_writes_are_siblings() {
        let mut reg = MvRegister::new();
        reg.write(OpId::new(actor(1), 1), stamp(1, 1, 0), &CausalContext::new(), "a");
        reg.write(OpId::new(actor(2), 1), stamp(1, 2, 0), &CausalContext::new(), "b");

        assert!(reg.is_conflicted());
        assert_eq!(reg.value(), Some(&"b"));
        assert_eq!(reg.values().copied().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn concurrent_order_does_not_matter() {
        let a = (OpId::new(actor(1), 1), stamp(3, 1, 0), "a");
        let b = (OpId::new(actor(2), 1), stamp(1, 2, 0), "b");
        let empty = CausalContext::new();

        let mut left = MvRegister::new();
        left.write(a.0, a.1, &empty, a.2);
        left.write(b.0, b.1, &empty, b.2);

        let mut right = MvRegister::new();
        right.write(b.0, b.1, &empty, b.2);
        right.write(a.0, a.1, &empty, a.2);

        assert_eq!(left, right);
        assert_eq!(left.value(), Some(&"a"));
    }

    #[test]
    fn later_write_in_same_change_wins() {
        let mut reg = MvRegister::new();
        let id = OpId::new(actor(1), 1);
        reg.write(id, stamp(1, 1, 0), &CausalContext::new(), 1);
        reg.write(id, stamp(1, 1, 4), &CausalContext::new(), 2);

        assert_eq!(reg.value(), Some(&2));
        assert!(!reg.is_conflicted());
    }

    #[test]
    fn replayed_write_is_ignored() {
        let mut reg = MvRegister::new();
        let id = OpId::new(actor(1), 1);
        reg.write(id, stamp(1, 1, 0), &CausalContext::new(), 1);
        reg.write(id, stamp(1, 1, 0), &CausalContext::new(), 1);
        assert_eq!(reg.values().count(), 1);
    }
}
