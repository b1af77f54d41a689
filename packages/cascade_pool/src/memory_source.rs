use std::alloc::{self, Layout};
use std::fmt::Debug;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Provider of raw memory regions for slab storage.
///
/// A [`PoolForest`][crate::PoolForest] acquires every slab through its memory
/// source and releases every slab back to it, so implementing this trait is
/// enough to observe or redirect all slab traffic of a forest. The default
/// source is [`SystemMemorySource`]; tests and benchmarks typically wrap it in
/// a [`TrackingMemorySource`] to account for every byte.
///
/// # Contract
///
/// * `acquire` is only called with layouts of non-zero size.
/// * `acquire` reports exhaustion by returning `None`; it must not panic or
///   terminate the process on its own.
/// * `release` is called exactly once for each successful `acquire`, with the
///   same layout the region was acquired with.
pub trait MemorySource: Debug {
    /// Acquires a region of raw memory matching `layout`.
    ///
    /// Returns `None` if the underlying provider cannot satisfy the request.
    fn acquire(&mut self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases a region previously returned by [`acquire`][Self::acquire].
    ///
    /// # Safety
    ///
    /// The caller must ensure that `region` was returned by a call to
    /// `acquire` on this same source with an identical `layout`, and that the
    /// region is not released more than once or accessed afterwards.
    unsafe fn release(&mut self, region: NonNull<u8>, layout: Layout);
}

/// Convenience alias for the boxed source a forest owns.
pub(crate) type DynMemorySource = dyn MemorySource + Send;

/// The default [`MemorySource`]: the process-global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMemorySource;

impl SystemMemorySource {
    /// Creates a new system memory source.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl MemorySource for SystemMemorySource {
    fn acquire(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(
            layout.size() > 0,
            "memory sources are never asked for zero-sized regions"
        );

        // SAFETY: The trait contract guarantees a non-zero-sized layout.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn release(&mut self, region: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding the caller's guarantee that the region came from
        // acquire() on this source with the same layout and is released once.
        unsafe {
            alloc::dealloc(region.as_ptr(), layout);
        }
    }
}

/// A [`MemorySource`] decorator that counts the traffic passing through it.
///
/// Wraps any inner source without changing its behavior. The counters live
/// behind a shared [`MemorySourceStats`] handle that remains readable after
/// the source itself has been moved into a forest, which is what makes
/// allocator-level accounting possible in tests:
///
/// ```
/// use cascade_pool::{PoolForest, TrackingMemorySource};
///
/// let source = TrackingMemorySource::system();
/// let stats = source.stats();
///
/// let mut forest = PoolForest::builder().memory_source(source).build();
/// let pool = forest.create_root();
/// forest.allocate(pool, 512).expect("pool is live");
///
/// assert!(stats.acquired_bytes() >= 512);
///
/// forest.destroy(pool).expect("pool is live");
///
/// // Every acquired byte has been released again.
/// assert_eq!(stats.outstanding_bytes(), 0);
/// ```
#[derive(Debug)]
pub struct TrackingMemorySource<S = SystemMemorySource> {
    inner: S,
    stats: MemorySourceStats,
}

impl TrackingMemorySource<SystemMemorySource> {
    /// Creates a tracking source backed by the process-global allocator.
    #[must_use]
    pub fn system() -> Self {
        Self::new(SystemMemorySource::new())
    }
}

impl<S: MemorySource> TrackingMemorySource<S> {
    /// Creates a tracking source wrapping the given inner source.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            stats: MemorySourceStats::default(),
        }
    }

    /// Returns a handle to the counters of this source.
    ///
    /// The handle shares state with the source, so it keeps reporting live
    /// values after the source has been handed to a forest.
    #[must_use]
    pub fn stats(&self) -> MemorySourceStats {
        self.stats.clone()
    }
}

impl<S: MemorySource> MemorySource for TrackingMemorySource<S> {
    fn acquire(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let region = self.inner.acquire(layout)?;
        self.stats.record_acquire(layout.size());
        Some(region)
    }

    unsafe fn release(&mut self, region: NonNull<u8>, layout: Layout) {
        self.stats.record_release(layout.size());

        // SAFETY: Forwarding the caller's guarantee unchanged to the inner
        // source, which is where the region originally came from.
        unsafe {
            self.inner.release(region, layout);
        }
    }
}

/// Shared view of the counters of a [`TrackingMemorySource`].
///
/// Cloning the handle is cheap and every clone observes the same counters.
/// Counters use atomic storage, so a handle may be read from a different
/// thread than the one driving the forest.
#[derive(Clone, Debug, Default)]
pub struct MemorySourceStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    acquired_bytes: AtomicUsize,
    released_bytes: AtomicUsize,
    acquire_count: AtomicUsize,
    release_count: AtomicUsize,
}

impl MemorySourceStats {
    /// Total bytes acquired from the inner source so far.
    #[must_use]
    pub fn acquired_bytes(&self) -> usize {
        self.inner.acquired_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes released back to the inner source so far.
    #[must_use]
    pub fn released_bytes(&self) -> usize {
        self.inner.released_bytes.load(Ordering::Relaxed)
    }

    /// Bytes currently held by the forest (acquired but not yet released).
    #[must_use]
    pub fn outstanding_bytes(&self) -> usize {
        // Saturating because a racing reader may observe a release before the
        // matching acquire; the counters themselves never go inconsistent.
        self.acquired_bytes().saturating_sub(self.released_bytes())
    }

    /// Number of successful acquire calls so far.
    #[must_use]
    pub fn acquire_count(&self) -> usize {
        self.inner.acquire_count.load(Ordering::Relaxed)
    }

    /// Number of release calls so far.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.inner.release_count.load(Ordering::Relaxed)
    }

    fn record_acquire(&self, bytes: usize) {
        self.inner.acquired_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.inner.acquire_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_release(&self, bytes: usize) {
        self.inner.released_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.inner.release_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SystemMemorySource: Send, Sync);
    assert_impl_all!(TrackingMemorySource: Send);
    assert_impl_all!(MemorySourceStats: Clone, Send, Sync);

    #[test]
    fn system_source_round_trip() {
        let mut source = SystemMemorySource::new();
        let layout = Layout::from_size_align(256, 8).expect("valid layout");

        let region = source.acquire(layout).expect("system allocator has memory");

        // SAFETY: The region was just acquired with this exact layout, so
        // writing within its bounds is valid.
        unsafe {
            region.as_ptr().write_bytes(0xAB, layout.size());
        }

        // SAFETY: The region came from acquire() with this layout and is
        // released exactly once.
        unsafe {
            source.release(region, layout);
        }
    }

    #[test]
    fn tracking_source_counts_acquires_and_releases() {
        let mut source = TrackingMemorySource::system();
        let stats = source.stats();
        let layout = Layout::from_size_align(128, 8).expect("valid layout");

        let region = source.acquire(layout).expect("system allocator has memory");

        assert_eq!(stats.acquired_bytes(), 128);
        assert_eq!(stats.acquire_count(), 1);
        assert_eq!(stats.outstanding_bytes(), 128);

        // SAFETY: The region came from acquire() with this layout and is
        // released exactly once.
        unsafe {
            source.release(region, layout);
        }

        assert_eq!(stats.released_bytes(), 128);
        assert_eq!(stats.release_count(), 1);
        assert_eq!(stats.outstanding_bytes(), 0);
    }

    #[test]
    fn tracking_source_reports_inner_exhaustion() {
        /// A source that refuses every request.
        #[derive(Debug)]
        struct EmptySource;

        impl MemorySource for EmptySource {
            fn acquire(&mut self, _layout: Layout) -> Option<NonNull<u8>> {
                None
            }

            unsafe fn release(&mut self, _region: NonNull<u8>, _layout: Layout) {
                unreachable!("nothing was ever acquired from this source");
            }
        }

        let mut source = TrackingMemorySource::new(EmptySource);
        let stats = source.stats();
        let layout = Layout::from_size_align(64, 8).expect("valid layout");

        assert!(source.acquire(layout).is_none());

        // Failed acquires are not counted as traffic.
        assert_eq!(stats.acquire_count(), 0);
        assert_eq!(stats.acquired_bytes(), 0);
    }

    #[test]
    fn stats_handles_share_counters() {
        let source = TrackingMemorySource::system();
        let first = source.stats();
        let second = source.stats();

        first.record_acquire(32);

        assert_eq!(second.acquired_bytes(), 32);
    }
}
