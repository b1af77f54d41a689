use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::forest::{DEFAULT_MIN_SLAB_BYTES, OomHandler};
use crate::{AllocationFailure, MemorySource, PoolForest, SystemMemorySource};

/// Builder for creating an instance of [`PoolForest`].
///
/// All settings are optional; [`build`][Self::build] with no configuration
/// produces a forest backed by the system allocator, with the default slab
/// floor and no out-of-memory handler.
///
/// # Examples
///
/// Default configuration:
///
/// ```
/// use cascade_pool::PoolForest;
///
/// let forest = PoolForest::builder().build();
/// ```
///
/// Full configuration:
///
/// ```
/// use cascade_pool::{PoolForest, TrackingMemorySource};
/// use new_zealand::nz;
///
/// let forest = PoolForest::builder()
///     .min_slab_bytes(nz!(4096))
///     .memory_source(TrackingMemorySource::system())
///     .oom_handler(|failure| {
///         eprintln!("pool exhausted: {} bytes requested", failure.requested_bytes());
///     })
///     .build();
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred
/// between threads, allowing forest configuration to happen on a different
/// thread than where the forest is used. However, it is not thread-safe
/// ([`Sync`]) as it contains mutable configuration state.
#[must_use]
pub struct PoolForestBuilder {
    min_slab_bytes: NonZero<usize>,
    memory_source: Option<Box<dyn MemorySource + Send>>,
    oom_handler: Option<OomHandler>,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl PoolForestBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            min_slab_bytes: DEFAULT_MIN_SLAB_BYTES,
            memory_source: None,
            oom_handler: None,
            _not_sync: PhantomData,
        }
    }

    /// Sets the capacity floor for newly acquired slabs.
    ///
    /// Allocation requests larger than the floor get a slab sized exactly for
    /// the request; everything else shares slabs of this size. The default is
    /// 8 KiB.
    ///
    /// # Examples
    ///
    /// ```
    /// use cascade_pool::PoolForest;
    /// use new_zealand::nz;
    ///
    /// let forest = PoolForest::builder().min_slab_bytes(nz!(65536)).build(); // 64 * 1024
    /// ```
    #[inline]
    pub fn min_slab_bytes(mut self, min_slab_bytes: NonZero<usize>) -> Self {
        self.min_slab_bytes = min_slab_bytes;
        self
    }

    /// Sets the memory source the forest acquires slabs from.
    ///
    /// The default is [`SystemMemorySource`]. Tests and benchmarks typically
    /// install a [`TrackingMemorySource`][crate::TrackingMemorySource] here to
    /// account for every byte the forest holds.
    #[inline]
    pub fn memory_source<S>(mut self, memory_source: S) -> Self
    where
        S: MemorySource + Send + 'static,
    {
        self.memory_source = Some(Box::new(memory_source));
        self
    }

    /// Installs an out-of-memory handler.
    ///
    /// The handler is invoked with an [`AllocationFailure`] report when the
    /// memory source cannot provide a slab; after it returns, the failing
    /// allocation call reports
    /// [`OutOfMemory`][crate::PoolError::OutOfMemory] instead of terminating
    /// the process. See [`PoolForest::allocate`].
    #[inline]
    pub fn oom_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(AllocationFailure) + Send + 'static,
    {
        self.oom_handler = Some(Box::new(handler));
        self
    }

    /// Builds the forest with the specified configuration.
    #[must_use]
    #[inline]
    pub fn build(self) -> PoolForest {
        let memory = self
            .memory_source
            .unwrap_or_else(|| Box::new(SystemMemorySource::new()));

        PoolForest::new_inner(memory, self.min_slab_bytes, self.oom_handler)
    }
}

impl fmt::Debug for PoolForestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolForestBuilder")
            .field("min_slab_bytes", &self.min_slab_bytes)
            .field("memory_source", &self.memory_source)
            .field("has_oom_handler", &self.oom_handler.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::TrackingMemorySource;

    assert_impl_all!(PoolForestBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(PoolForestBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = PoolForestBuilder::new();

        assert_eq!(builder.min_slab_bytes, DEFAULT_MIN_SLAB_BYTES);
        assert!(builder.memory_source.is_none());
        assert!(builder.oom_handler.is_none());
    }

    #[test]
    fn min_slab_bytes_sets_floor_correctly() {
        let builder = PoolForestBuilder::new().min_slab_bytes(nz!(1024));

        assert_eq!(builder.min_slab_bytes, nz!(1024));
    }

    #[test]
    fn min_slab_bytes_can_be_overridden() {
        let builder = PoolForestBuilder::new()
            .min_slab_bytes(nz!(1024))
            .min_slab_bytes(nz!(2048));

        assert_eq!(builder.min_slab_bytes, nz!(2048));
    }

    #[test]
    fn memory_source_sets_source() {
        let builder = PoolForestBuilder::new().memory_source(TrackingMemorySource::system());

        assert!(builder.memory_source.is_some());
    }

    #[test]
    fn oom_handler_sets_handler() {
        let builder = PoolForestBuilder::new().oom_handler(|_failure| {});

        assert!(builder.oom_handler.is_some());
    }

    #[test]
    fn build_applies_configuration() {
        let mut forest = PoolForestBuilder::new().min_slab_bytes(nz!(4096)).build();

        assert_eq!(forest.min_slab_bytes(), nz!(4096));

        // The forest works.
        let pool = forest.create_root();
        _ = forest.allocate(pool, 16).expect("pool is live");
        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn builder_is_debug() {
        let builder = PoolForestBuilder::new().oom_handler(|_failure| {});
        let rendered = format!("{builder:?}");

        assert!(rendered.contains("PoolForestBuilder"));
        assert!(rendered.contains("has_oom_handler"));
    }

    #[test]
    fn builder_send_trait() {
        let builder = PoolForestBuilder::new().min_slab_bytes(nz!(1024));

        // Verify the builder can be moved between threads.
        let handle = std::thread::spawn(move || builder.build());
        let _forest = handle.join().expect("thread completed successfully");
    }
}
