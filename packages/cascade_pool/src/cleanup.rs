use std::error::Error;
use std::fmt;

use crate::PoolHandle;

/// The result type cleanup callbacks report.
///
/// A callback that returns an error does not interrupt teardown: the remaining
/// callbacks of the pool (and of the rest of the subtree) still run, and the
/// collected failures are reported together as
/// [`CleanupFailed`][crate::PoolError::CleanupFailed] once teardown completes.
pub type CleanupResult = std::result::Result<(), Box<dyn Error + Send + Sync>>;

/// The boxed form in which a pool stores registered callbacks.
pub(crate) type CleanupFn = Box<dyn FnOnce() -> CleanupResult + Send>;

/// When a cleanup callback runs relative to the teardown of child pools.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum CleanupPhase {
    /// Runs before any child pool is torn down.
    ///
    /// For resources that must be retired while the whole subtree is still
    /// intact, e.g. a watcher that observes objects owned by child pools.
    BeforeChildren,

    /// Runs after every child pool has been fully torn down. This is the
    /// default, matching the usual acquisition order: a pool's own resources
    /// are acquired before work is delegated to child pools.
    #[default]
    AfterChildren,
}

/// One registered cleanup callback, stored by its pool in registration order.
///
/// Execution during teardown is in reverse-registration order within each
/// [`CleanupPhase`], mirroring acquisition order: the most recently acquired
/// resource is released first.
pub(crate) struct CleanupEntry {
    /// Serial number identifying this registration within its pool; carried by
    /// the [`CleanupToken`][crate::CleanupToken] handed back to the caller.
    serial: u64,

    phase: CleanupPhase,

    callback: CleanupFn,
}

impl CleanupEntry {
    #[must_use]
    pub(crate) fn new(serial: u64, phase: CleanupPhase, callback: CleanupFn) -> Self {
        Self {
            serial,
            phase,
            callback,
        }
    }

    #[must_use]
    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    #[must_use]
    pub(crate) fn phase(&self) -> CleanupPhase {
        self.phase
    }

    /// Consumes the entry and runs its callback.
    pub(crate) fn run(self) -> CleanupResult {
        (self.callback)()
    }
}

impl fmt::Debug for CleanupEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupEntry")
            .field("serial", &self.serial)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Record of one cleanup callback that reported failure during teardown.
///
/// Collected across the whole subtree being destroyed or cleared and reported
/// once, via [`CleanupFailed`][crate::PoolError::CleanupFailed], after every
/// callback has run.
#[derive(Debug)]
pub struct CleanupFailure {
    pool: PoolHandle,
    serial: u64,
    error: Box<dyn Error + Send + Sync>,
}

impl CleanupFailure {
    #[must_use]
    pub(crate) fn new(pool: PoolHandle, serial: u64, error: Box<dyn Error + Send + Sync>) -> Self {
        Self {
            pool,
            serial,
            error,
        }
    }

    /// Handle of the pool the failed callback was registered on.
    ///
    /// The pool may no longer be live by the time the failure is reported; the
    /// handle serves to correlate the failure with the caller's bookkeeping.
    #[must_use]
    pub fn pool(&self) -> PoolHandle {
        self.pool
    }

    /// The error the callback reported.
    #[must_use]
    pub fn error(&self) -> &(dyn Error + Send + Sync) {
        self.error.as_ref()
    }
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cleanup callback {} on {:?} failed: {}",
            self.serial, self.pool, self.error
        )
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(CleanupFailure: Debug, Send, Sync);
    assert_impl_all!(CleanupPhase: Copy, Debug, Eq);

    #[test]
    fn entry_runs_its_callback_once() {
        let entry = CleanupEntry::new(1, CleanupPhase::AfterChildren, Box::new(|| Ok(())));

        assert!(entry.run().is_ok());
    }

    #[test]
    fn entry_reports_callback_failure() {
        let entry = CleanupEntry::new(
            1,
            CleanupPhase::AfterChildren,
            Box::new(|| Err("resource already gone".into())),
        );

        let error = entry.run().expect_err("callback fails");
        assert_eq!(error.to_string(), "resource already gone");
    }

    #[test]
    fn default_phase_is_after_children() {
        assert_eq!(CleanupPhase::default(), CleanupPhase::AfterChildren);
    }

    #[test]
    fn failure_display_includes_cause() {
        let failure = CleanupFailure::new(
            PoolHandle::from_parts(1, 0, 0),
            7,
            "file handle refused to close".into(),
        );

        let rendered = failure.to_string();
        assert!(rendered.contains("file handle refused to close"));
        assert!(rendered.contains('7'));
    }

    #[test]
    fn entry_debug_omits_the_callback() {
        let entry = CleanupEntry::new(3, CleanupPhase::BeforeChildren, Box::new(|| Ok(())));

        let rendered = format!("{entry:?}");
        assert!(rendered.contains("serial"));
        assert!(rendered.contains("BeforeChildren"));
    }
}
