use thiserror::Error;

use crate::{CleanupFailure, PoolHandle};

/// Errors that can occur when operating on a [`PoolForest`][crate::PoolForest].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The memory source could not provide a new slab.
    ///
    /// This is only returned when an out-of-memory handler is installed and has
    /// returned control to the allocator. Without a handler, slab acquisition
    /// failure is fatal to the process.
    #[error("the memory source could not provide {requested_bytes} bytes")]
    OutOfMemory {
        /// Number of bytes the caller asked the pool for.
        requested_bytes: usize,
    },

    /// The handle does not refer to a live pool in this forest.
    ///
    /// Either the pool it referred to has since been destroyed, the handle came
    /// from a different forest, or the pool is currently mid-teardown and cannot
    /// accept new work.
    #[error("handle {handle:?} does not refer to a live pool in this forest")]
    InvalidHandle {
        /// The offending handle.
        handle: PoolHandle,
    },

    /// `destroy` was called on a handle whose pool has already been destroyed.
    ///
    /// This always indicates a dangling handle still in use by the caller; it is
    /// reported rather than silently ignored.
    #[error("handle {handle:?} refers to a pool that was already destroyed")]
    DoubleDestroy {
        /// The offending handle.
        handle: PoolHandle,
    },

    /// `destroy` or `clear` was called on a pool whose teardown is already in
    /// progress.
    ///
    /// This state is observable after a cleanup callback panicked mid-teardown,
    /// leaving the pool poisoned. Dropping or terminating the forest still
    /// reclaims the pool's memory.
    #[error("handle {handle:?} refers to a pool whose teardown is already in progress")]
    ReentrantDestroy {
        /// The offending handle.
        handle: PoolHandle,
    },

    /// One or more cleanup callbacks reported failure during `destroy` or
    /// `clear`.
    ///
    /// Teardown is never interrupted by a failing callback: every remaining
    /// callback in the affected subtree still runs and all memory is still
    /// reclaimed. The collected failures are reported together, once, after the
    /// teardown has completed.
    #[error("{} cleanup callback(s) failed during pool teardown", failures.len())]
    CleanupFailed {
        /// One record per failed callback, in the order the failures occurred.
        failures: Vec<CleanupFailure>,
    },

    /// The cleanup token no longer identifies a registered callback.
    ///
    /// The callback has already run (during `destroy`, `clear` or
    /// [`run_cleanup`][crate::PoolForest::run_cleanup]) or was already
    /// unregistered.
    #[error("cleanup token {token_serial} on {handle:?} no longer identifies a registered callback")]
    StaleCleanupToken {
        /// Handle of the pool the registration belonged to.
        handle: PoolHandle,

        /// Serial number of the stale registration.
        token_serial: u64,
    },
}

/// A specialized `Result` type for pool forest operations, returning the
/// crate's [`PoolError`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PoolError: Send, Sync, Debug);

    #[test]
    fn out_of_memory_mentions_requested_bytes() {
        let error = PoolError::OutOfMemory {
            requested_bytes: 4096,
        };

        assert!(error.to_string().contains("4096"));
    }

    #[test]
    fn cleanup_failed_mentions_failure_count() {
        let error = PoolError::CleanupFailed { failures: vec![] };

        assert!(error.to_string().contains('0'));
    }
}
