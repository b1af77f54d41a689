use crate::{CleanupEntry, CleanupPhase, PoolHandle, Slab};

/// Lifecycle state of a pool node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PoolState {
    /// The pool accepts allocations, cleanup registrations and child pools.
    Live,

    /// Teardown of the pool is in progress (or was interrupted by a panicking
    /// cleanup callback). The pool accepts no further work; attempting to
    /// destroy or clear it again is reported as reentrant.
    TearingDown,
}

/// One pool in the tree.
///
/// Nodes are owned by the forest's slot arena, not by their parent: the parent
/// holds the handles of its children (the owning direction for teardown
/// purposes) while each child holds a non-owning back-handle to its parent.
/// This keeps the ownership graph acyclic while preserving the lifetime
/// invariant that a child never outlives its parent.
#[derive(Debug)]
pub(crate) struct PoolNode {
    /// Back-handle to the parent pool; `None` for root pools.
    parent: Option<PoolHandle>,

    /// Child pools in creation order. Teardown iterates this in order, so the
    /// first child created is the first torn down.
    pub(crate) children: Vec<PoolHandle>,

    /// Slabs in acquisition order; allocation always bumps into the last one.
    pub(crate) slabs: Vec<Slab>,

    /// Cleanup registrations in registration order (both phases interleaved).
    /// Teardown drains one phase at a time and runs it back to front.
    pub(crate) cleanups: Vec<CleanupEntry>,

    /// Serial to assign to the next cleanup registration.
    pub(crate) next_cleanup_serial: u64,

    pub(crate) state: PoolState,

    /// Optional diagnostic label, surfaced through `Debug` output and the
    /// forest's label accessors.
    pub(crate) label: Option<&'static str>,

    /// Total payload bytes handed out by this pool since it was created or
    /// last cleared. Alignment padding is not counted.
    pub(crate) allocated_bytes: usize,
}

impl PoolNode {
    #[must_use]
    pub(crate) fn new(parent: Option<PoolHandle>) -> Self {
        Self {
            parent,
            children: Vec::new(),
            slabs: Vec::new(),
            cleanups: Vec::new(),
            next_cleanup_serial: 0,
            state: PoolState::Live,
            label: None,
            allocated_bytes: 0,
        }
    }

    #[must_use]
    pub(crate) fn parent(&self) -> Option<PoolHandle> {
        self.parent
    }

    #[must_use]
    pub(crate) fn is_live(&self) -> bool {
        self.state == PoolState::Live
    }

    /// Removes and returns all cleanup entries of the given phase, preserving
    /// their relative registration order. Entries of the other phase stay
    /// registered, also in order.
    #[must_use]
    pub(crate) fn drain_cleanup_phase(&mut self, phase: CleanupPhase) -> Vec<CleanupEntry> {
        let mut drained = Vec::new();
        let mut kept = Vec::with_capacity(self.cleanups.len());

        for entry in std::mem::take(&mut self.cleanups) {
            if entry.phase() == phase {
                drained.push(entry);
            } else {
                kept.push(entry);
            }
        }

        self.cleanups = kept;
        drained
    }
}

/// One slot in the forest's arena of pool nodes.
///
/// Slots are reused after their pool is destroyed; the generation counter only
/// ever grows, which is what lets the forest tell a stale handle (generation
/// in the slot's past) from a foreign one (generation the slot never reached).
#[derive(Debug)]
pub(crate) struct PoolSlot {
    /// Generation stamped into handles issued for the current occupant.
    /// Incremented when the occupant is destroyed.
    pub(crate) generation: u64,

    /// The occupant, if any.
    pub(crate) node: Option<PoolNode>,
}

impl PoolSlot {
    #[must_use]
    pub(crate) fn occupied(node: PoolNode) -> Self {
        Self {
            generation: 0,
            node: Some(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CleanupPhase;

    fn entry(serial: u64, phase: CleanupPhase) -> CleanupEntry {
        CleanupEntry::new(serial, phase, Box::new(|| Ok(())))
    }

    #[test]
    fn new_node_is_live_and_empty() {
        let node = PoolNode::new(None);

        assert!(node.is_live());
        assert!(node.children.is_empty());
        assert!(node.slabs.is_empty());
        assert!(node.cleanups.is_empty());
        assert_eq!(node.allocated_bytes, 0);
        assert_eq!(node.parent(), None);
    }

    #[test]
    fn drain_separates_phases_preserving_order() {
        let mut node = PoolNode::new(None);
        node.cleanups.push(entry(0, CleanupPhase::AfterChildren));
        node.cleanups.push(entry(1, CleanupPhase::BeforeChildren));
        node.cleanups.push(entry(2, CleanupPhase::AfterChildren));
        node.cleanups.push(entry(3, CleanupPhase::BeforeChildren));

        let before: Vec<u64> = node
            .drain_cleanup_phase(CleanupPhase::BeforeChildren)
            .iter()
            .map(CleanupEntry::serial)
            .collect();
        assert_eq!(before, [1, 3]);

        let remaining: Vec<u64> = node.cleanups.iter().map(CleanupEntry::serial).collect();
        assert_eq!(remaining, [0, 2]);

        let after: Vec<u64> = node
            .drain_cleanup_phase(CleanupPhase::AfterChildren)
            .iter()
            .map(CleanupEntry::serial)
            .collect();
        assert_eq!(after, [0, 2]);
        assert!(node.cleanups.is_empty());
    }

    #[test]
    fn fresh_slot_starts_at_generation_zero() {
        let slot = PoolSlot::occupied(PoolNode::new(None));

        assert_eq!(slot.generation, 0);
        assert!(slot.node.is_some());
    }
}
