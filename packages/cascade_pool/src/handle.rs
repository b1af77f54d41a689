/// An opaque handle identifying one pool within a [`PoolForest`][crate::PoolForest].
///
/// Handles are plain copyable values that remain cheap to pass around and store.
/// A handle does not keep its pool alive: once the pool is destroyed (directly
/// or via an ancestor), every handle to it becomes stale. Stale handles are
/// detected by the forest and reported as typed errors; they never cause
/// undefined behavior.
///
/// A handle is only meaningful to the forest that issued it. Presenting it to a
/// different forest is detected on a best-effort basis and reported as
/// [`InvalidHandle`][crate::PoolError::InvalidHandle].
///
/// # Examples
///
/// ```
/// use cascade_pool::PoolForest;
///
/// let mut forest = PoolForest::new();
/// let pool = forest.create_root();
///
/// // Handles are freely copyable.
/// let same_pool = pool;
/// assert_eq!(pool, same_pool);
///
/// forest.destroy(pool).expect("pool is live");
///
/// // The copy is now stale, which the forest detects.
/// assert!(forest.allocate(same_pool, 16).is_err());
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PoolHandle {
    /// Identifier of the forest that issued this handle, so that handles
    /// presented to the wrong forest are rejected instead of resolving to an
    /// unrelated pool that happens to occupy the same slot.
    forest_id: u64,

    /// Index of the pool's slot in the forest's slot arena.
    index: usize,

    /// Generation the slot had when this handle was issued. Slot generations
    /// only ever grow, so a mismatch tells us whether the pool was destroyed
    /// (slot moved on) or the handle is foreign (slot never got there).
    generation: u64,
}

impl PoolHandle {
    #[must_use]
    pub(crate) fn from_parts(forest_id: u64, index: usize, generation: u64) -> Self {
        Self {
            forest_id,
            index,
            generation,
        }
    }

    /// Returns the identifier of the forest that issued this handle.
    #[must_use]
    pub(crate) fn forest_id(&self) -> u64 {
        self.forest_id
    }

    /// Returns the slot index this handle refers to.
    #[must_use]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Returns the slot generation this handle was issued against.
    #[must_use]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

/// An opaque token identifying one cleanup registration on one pool.
///
/// Returned by [`register_cleanup`][crate::PoolForest::register_cleanup] and
/// [`register_pre_cleanup`][crate::PoolForest::register_pre_cleanup]; consumed
/// by [`unregister_cleanup`][crate::PoolForest::unregister_cleanup] and
/// [`run_cleanup`][crate::PoolForest::run_cleanup].
///
/// Tokens are copyable, so it is possible to present one after its registration
/// has already run or been removed. The forest detects this and reports
/// [`StaleCleanupToken`][crate::PoolError::StaleCleanupToken] rather than
/// running anything twice.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CleanupToken {
    /// The pool the registration belongs to.
    pool: PoolHandle,

    /// Serial number of the registration, unique within the pool's lifetime.
    serial: u64,
}

impl CleanupToken {
    #[must_use]
    pub(crate) fn from_parts(pool: PoolHandle, serial: u64) -> Self {
        Self { pool, serial }
    }

    /// Returns the handle of the pool this registration belongs to.
    #[must_use]
    pub(crate) fn pool(&self) -> PoolHandle {
        self.pool
    }

    /// Returns the serial number of the registration.
    #[must_use]
    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;
    use std::hash::Hash;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PoolHandle: Copy, Debug, Eq, Hash, Send, Sync);
    assert_impl_all!(CleanupToken: Copy, Debug, Eq, Hash, Send, Sync);

    #[test]
    fn handles_with_same_parts_are_equal() {
        let a = PoolHandle::from_parts(1, 3, 7);
        let b = PoolHandle::from_parts(1, 3, 7);

        assert_eq!(a, b);
    }

    #[test]
    fn handles_with_different_generations_are_distinct() {
        let a = PoolHandle::from_parts(1, 3, 7);
        let b = PoolHandle::from_parts(1, 3, 8);

        assert_ne!(a, b);
    }

    #[test]
    fn handles_from_different_forests_are_distinct() {
        let a = PoolHandle::from_parts(1, 3, 7);
        let b = PoolHandle::from_parts(2, 3, 7);

        assert_ne!(a, b);
    }

    #[test]
    fn token_remembers_pool_and_serial() {
        let pool = PoolHandle::from_parts(1, 0, 0);
        let token = CleanupToken::from_parts(pool, 42);

        assert_eq!(token.pool(), pool);
        assert_eq!(token.serial(), 42);
    }
}
