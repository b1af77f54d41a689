use std::alloc::Layout;
use std::num::NonZero;
use std::ptr::NonNull;
use std::thread;

use new_zealand::nz;

use crate::DynMemorySource;

/// Alignment of every region handed out by a pool.
///
/// Suitable for any fundamental type. Callers with stricter alignment needs
/// must over-allocate and align within the region themselves.
pub(crate) const ALLOCATION_ALIGNMENT: NonZero<usize> = nz!(16);

/// One contiguous region of raw memory owned by a single pool, filled front to
/// back by bump-pointer allocation.
///
/// A slab never returns individual allocations; all of its memory is reclaimed
/// in one step when the owning pool is destroyed or cleared, by handing the
/// slab back to the memory source it was acquired from.
///
/// # Release protocol
///
/// Slabs are released explicitly via [`release`][Self::release] because doing
/// so requires the memory source, which the slab deliberately does not hold a
/// reference to. Dropping an unreleased slab is a leak and panics (unless the
/// thread is already panicking), mirroring the drop-time ownership checks of
/// the rest of the crate.
#[derive(Debug)]
pub(crate) struct Slab {
    /// Base address of the region acquired from the memory source.
    base: NonNull<u8>,

    /// The exact layout the region was acquired with; required to release it.
    layout: Layout,

    /// High-water mark: bytes from `base` already handed out (including
    /// alignment padding). Never decreases.
    used: usize,

    /// Set by `release()`. Guards against slabs being dropped without their
    /// memory being returned to the source.
    released: bool,
}

impl Slab {
    /// Acquires a new slab of `capacity` bytes from the memory source.
    ///
    /// Returns `None` if the source cannot satisfy the request; the caller
    /// decides how to surface that (this is where the out-of-memory policy of
    /// the forest hooks in).
    #[must_use]
    pub(crate) fn acquire(source: &mut DynMemorySource, capacity: NonZero<usize>) -> Option<Self> {
        let layout = Layout::from_size_align(capacity.get(), ALLOCATION_ALIGNMENT.get())
            .expect("slab layout is always valid: non-zero size with constant power-of-two alignment");

        let base = source.acquire(layout)?;

        Some(Self {
            base,
            layout,
            used: 0,
            released: false,
        })
    }

    /// Carves `size` bytes off the front of the remaining capacity.
    ///
    /// The returned region starts at an [`ALLOCATION_ALIGNMENT`]-aligned
    /// offset and remains valid until the slab is released. Returns `None` if
    /// the remaining capacity cannot fit the request; the slab is unchanged in
    /// that case.
    #[must_use]
    pub(crate) fn try_allocate(&mut self, size: NonZero<usize>) -> Option<NonNull<[u8]>> {
        let offset = align_up(self.used, ALLOCATION_ALIGNMENT);
        let end = offset.checked_add(size.get())?;

        if end > self.capacity() {
            return None;
        }

        self.used = end;

        // SAFETY: offset + size <= capacity, so the entire region lies within
        // the allocation we acquired from the memory source in acquire().
        let start = unsafe { self.base.byte_add(offset) };

        Some(NonNull::slice_from_raw_parts(start, size.get()))
    }

    /// Returns the total capacity of the slab in bytes.
    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns the current high-water mark in bytes.
    #[must_use]
    #[cfg(test)]
    pub(crate) fn used(&self) -> usize {
        self.used
    }

    /// Returns the whole slab to the memory source it was acquired from.
    pub(crate) fn release(mut self, source: &mut DynMemorySource) {
        self.released = true;

        // SAFETY: base and layout are exactly what source.acquire() returned
        // in acquire(), and the released flag ensures this happens only once.
        unsafe {
            source.release(self.base, self.layout);
        }
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // If we are already panicking, do not panic again - that would merely
        // obscure the original panic and turn it into an abort.
        if !self.released && !thread::panicking() {
            panic!(
                "dropped a Slab of {} bytes without releasing it to its memory source",
                self.capacity()
            );
        }
    }
}

// SAFETY: Slab contains a raw pointer but it refers to an allocation the slab
// owns exclusively; nothing is shared between threads and no thread-local
// state is involved. Access is governed by &self/&mut self borrows.
unsafe impl Send for Slab {}

/// Rounds `value` up to the next multiple of `alignment`.
fn align_up(value: usize, alignment: NonZero<usize>) -> usize {
    debug_assert!(alignment.get().is_power_of_two());

    // Cannot overflow: value is bounded by an existing allocation's size and
    // the alignment is a small constant.
    let mask = alignment.get().wrapping_sub(1);
    value.wrapping_add(mask) & !mask
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{MemorySource, SystemMemorySource, TrackingMemorySource};

    assert_impl_all!(Slab: Send);

    fn acquire_slab(source: &mut DynMemorySource, capacity: usize) -> Slab {
        Slab::acquire(source, NonZero::new(capacity).expect("test capacity is non-zero"))
            .expect("system allocator has memory")
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut source = SystemMemorySource::new();
        let mut slab = acquire_slab(&mut source, 1024);

        let first = slab.try_allocate(nz!(10)).expect("fits");
        let second = slab.try_allocate(nz!(10)).expect("fits");

        let first_addr = first.cast::<u8>().as_ptr() as usize;
        let second_addr = second.cast::<u8>().as_ptr() as usize;

        assert_eq!(first_addr % ALLOCATION_ALIGNMENT.get(), 0);
        assert_eq!(second_addr % ALLOCATION_ALIGNMENT.get(), 0);

        // The second region starts beyond the end of the first.
        assert!(second_addr >= first_addr.checked_add(10).expect("small values"));

        slab.release(&mut source);
    }

    #[test]
    fn allocation_beyond_capacity_is_refused() {
        let mut source = SystemMemorySource::new();
        let mut slab = acquire_slab(&mut source, 64);

        assert!(slab.try_allocate(nz!(48)).is_some());
        assert!(slab.try_allocate(nz!(48)).is_none());

        // A refused allocation leaves the high-water mark untouched.
        assert_eq!(slab.used(), 48);

        slab.release(&mut source);
    }

    #[test]
    fn exact_fit_is_accepted() {
        let mut source = SystemMemorySource::new();
        let mut slab = acquire_slab(&mut source, 64);

        assert!(slab.try_allocate(nz!(64)).is_some());
        assert!(slab.try_allocate(nz!(1)).is_none());

        slab.release(&mut source);
    }

    #[test]
    fn regions_are_writable() {
        let mut source = SystemMemorySource::new();
        let mut slab = acquire_slab(&mut source, 256);

        let region = slab.try_allocate(nz!(128)).expect("fits");

        // SAFETY: The region was just carved from the slab and is valid for
        // writes of its full length.
        unsafe {
            region.cast::<u8>().as_ptr().write_bytes(0xCD, region.len());
        }

        slab.release(&mut source);
    }

    #[test]
    fn release_returns_bytes_to_source() {
        let mut source = TrackingMemorySource::system();
        let stats = source.stats();

        let slab = acquire_slab(&mut source, 512);
        assert_eq!(stats.outstanding_bytes(), 512);

        slab.release(&mut source);
        assert_eq!(stats.outstanding_bytes(), 0);
    }

    #[test]
    #[should_panic]
    fn dropping_unreleased_slab_panics() {
        let mut source = SystemMemorySource::new();
        let slab = acquire_slab(&mut source, 64);

        // Dropping without release() leaks the region; the slab reports this
        // loudly instead of leaking silently.
        drop(slab);
    }

    #[test]
    fn align_up_rounds_to_alignment_boundaries() {
        assert_eq!(align_up(0, ALLOCATION_ALIGNMENT), 0);
        assert_eq!(align_up(1, ALLOCATION_ALIGNMENT), 16);
        assert_eq!(align_up(16, ALLOCATION_ALIGNMENT), 16);
        assert_eq!(align_up(17, ALLOCATION_ALIGNMENT), 32);
    }
}
