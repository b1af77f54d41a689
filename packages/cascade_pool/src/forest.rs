use std::alloc::Layout;
use std::cmp;
use std::fmt;
use std::mem;
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use new_zealand::nz;

use crate::slab::ALLOCATION_ALIGNMENT;
use crate::{
    CleanupEntry, CleanupFailure, CleanupFn, CleanupPhase, CleanupResult, CleanupToken,
    DynMemorySource, PoolError, PoolForestBuilder, PoolHandle, PoolNode, PoolSlot, PoolState,
    Result, Slab,
};

/// Global counter for generating unique forest IDs.
static FOREST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a unique forest ID.
fn generate_forest_id() -> u64 {
    FOREST_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Minimum capacity of a newly acquired slab unless configured otherwise via
/// [`PoolForestBuilder::min_slab_bytes`]. Requests larger than the floor get a
/// slab sized exactly for the request.
pub(crate) const DEFAULT_MIN_SLAB_BYTES: NonZero<usize> = nz!(8192); // 8 * 1024

/// A forest of hierarchical memory pools with deterministic teardown.
///
/// Pools are arenas: objects are allocated together out of slabs and reclaimed
/// together, with no per-object free. Pools form a tree - destroying a pool
/// first tears down every descendant (children in creation order, depth-first,
/// each completing before the next begins), then runs the pool's own cleanup
/// callbacks in reverse-registration order, and only then returns the pool's
/// slabs to the memory source.
///
/// The forest is the explicit owner of all of this state. There is no ambient
/// process-global pool: every operation goes through a forest you constructed,
/// which is what makes it possible to use isolated forests in tests and to run
/// independent forests on different threads.
///
/// # Handles
///
/// Pools are addressed through [`PoolHandle`] values, which are plain copyable
/// tokens. The forest validates every handle it is given: handles to destroyed
/// pools, handles from other forests and handles to pools whose teardown is in
/// progress are reported as typed errors, never undefined behavior.
///
/// # Allocation
///
/// [`allocate`][Self::allocate] bump-allocates from the pool's current slab,
/// acquiring a new slab from the [`MemorySource`][crate::MemorySource] when
/// the current one is exhausted. Regions live exactly as long as their pool:
/// until it is destroyed or cleared. There is deliberately no per-region free.
///
/// # Cleanup callbacks
///
/// Callbacks registered with [`register_cleanup`][Self::register_cleanup] run
/// during `destroy`/`clear`, after all children are gone, in
/// reverse-registration order - the resource acquired last is released first.
/// [`register_pre_cleanup`][Self::register_pre_cleanup] schedules a callback
/// for the phase before child teardown instead. A failing callback never
/// interrupts teardown; failures are collected and reported together at the
/// end.
///
/// # Out of memory
///
/// Slab acquisition failure consults the installed out-of-memory handler; if
/// the handler returns, the allocation call reports
/// [`OutOfMemory`][PoolError::OutOfMemory]. Without a handler the failure is
/// fatal to the process (see [`allocate`][Self::allocate]).
///
/// # Thread safety
///
/// The forest is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]): a
/// pool tree and everything in it belongs to one thread at a time, with no
/// internal locking. Distinct forests are fully independent and may be used
/// concurrently from different threads.
///
/// # Examples
///
/// ```
/// use cascade_pool::PoolForest;
///
/// let mut forest = PoolForest::new();
///
/// let request = forest.create_root();
/// let parser = forest.create_child(request).expect("request pool is live");
///
/// // Bump-allocate scratch space from the child pool.
/// let scratch = forest.allocate(parser, 256).expect("parser pool is live");
/// assert_eq!(scratch.len(), 256);
///
/// // Tie a resource to the request pool's lifetime.
/// forest
///     .register_cleanup(request, || {
///         println!("releasing the request's resources");
///         Ok(())
///     })
///     .expect("request pool is live");
///
/// // Destroying the request pool tears down the parser pool first, then runs
/// // the cleanup, then reclaims all slabs.
/// forest.destroy(request).expect("cleanups succeed");
/// ```
pub struct PoolForest {
    /// Distinguishes this forest's handles from handles issued by any other
    /// forest in the process. If the ID does not match, the handle is rejected.
    forest_id: u64,

    /// Slot arena holding every pool node; indexed by [`PoolHandle`].
    slots: Vec<PoolSlot>,

    /// Indexes of vacant slots, reused before the arena grows.
    free_slot_indexes: Vec<usize>,

    /// Root pools in creation order. [`terminate`][Self::terminate] and `Drop`
    /// tear these down in this order.
    roots: Vec<PoolHandle>,

    /// Provider of slab memory for every pool in the forest.
    memory: Box<DynMemorySource>,

    /// Capacity floor for newly acquired slabs.
    min_slab_bytes: NonZero<usize>,

    /// Invoked when the memory source cannot provide a slab. `None` means slab
    /// acquisition failure is fatal.
    oom_handler: Option<OomHandler>,
}

/// The boxed form in which a forest stores its out-of-memory handler.
pub(crate) type OomHandler = Box<dyn FnMut(AllocationFailure) + Send>;

/// Report passed to the out-of-memory handler when the memory source cannot
/// provide a slab.
///
/// The handler must not attempt to allocate from the pool that failed; the
/// report is a plain value precisely so that handling it requires no further
/// pool memory.
#[derive(Clone, Copy, Debug)]
pub struct AllocationFailure {
    requested_bytes: usize,
    slab_bytes: usize,
}

impl AllocationFailure {
    #[must_use]
    pub(crate) fn new(requested_bytes: usize, slab_bytes: usize) -> Self {
        Self {
            requested_bytes,
            slab_bytes,
        }
    }

    /// Number of bytes the caller asked the pool for.
    #[must_use]
    pub fn requested_bytes(&self) -> usize {
        self.requested_bytes
    }

    /// Capacity of the slab the forest tried to acquire to satisfy the
    /// request (the request rounded up to the configured slab floor).
    #[must_use]
    pub fn slab_bytes(&self) -> usize {
        self.slab_bytes
    }
}

/// How a handle relates to the forest's current state.
enum HandleState {
    /// Refers to a live pool.
    Live,

    /// Refers to a pool whose teardown is in progress.
    TearingDown,

    /// Referred to a pool in this forest that has since been destroyed.
    Destroyed,

    /// Never belonged to this forest.
    Foreign,
}

impl PoolForest {
    /// Creates a forest with default configuration: the system memory source,
    /// the default slab floor and no out-of-memory handler.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring a new forest.
    ///
    /// # Examples
    ///
    /// ```
    /// use cascade_pool::{PoolForest, TrackingMemorySource};
    /// use new_zealand::nz;
    ///
    /// let mut forest = PoolForest::builder()
    ///     .min_slab_bytes(nz!(4096))
    ///     .memory_source(TrackingMemorySource::system())
    ///     .build();
    ///
    /// let pool = forest.create_root();
    /// forest.destroy(pool).expect("pool is live");
    /// ```
    #[must_use]
    pub fn builder() -> PoolForestBuilder {
        PoolForestBuilder::new()
    }

    #[must_use]
    pub(crate) fn new_inner(
        memory: Box<DynMemorySource>,
        min_slab_bytes: NonZero<usize>,
        oom_handler: Option<OomHandler>,
    ) -> Self {
        Self {
            forest_id: generate_forest_id(),
            slots: Vec::new(),
            free_slot_indexes: Vec::new(),
            roots: Vec::new(),
            memory,
            min_slab_bytes,
            oom_handler,
        }
    }

    /// Creates a new root pool, tracked directly by the forest.
    ///
    /// Root pools live until destroyed explicitly or until the forest itself
    /// is terminated or dropped, at which point remaining roots are torn down
    /// in creation order.
    pub fn create_root(&mut self) -> PoolHandle {
        let handle = self.insert_node(PoolNode::new(None));
        self.roots.push(handle);
        handle
    }

    /// Creates a new pool as the youngest child of `parent`.
    ///
    /// The child's lifetime is bounded by the parent's: destroying the parent
    /// tears the child down first. Children are torn down in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if `parent` is not
    /// live: already destroyed, mid-teardown or from another forest.
    pub fn create_child(&mut self, parent: PoolHandle) -> Result<PoolHandle> {
        // Validate before burning a slot on a dead parent.
        self.ensure_live(parent)?;

        let handle = self.insert_node(PoolNode::new(Some(parent)));

        self.occupied_node_mut(parent.index()).children.push(handle);

        Ok(handle)
    }

    /// Allocates `size` bytes from the pool.
    ///
    /// The region starts at a 16-byte-aligned address and remains valid until
    /// the pool is destroyed or cleared; there is no way to free it earlier.
    /// Zero-byte requests succeed with an empty region and consume no slab
    /// space.
    ///
    /// The forest bump-allocates from the pool's current slab and acquires a
    /// new slab when it is exhausted, sized
    /// `max(size, min_slab_bytes)`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if the pool is not
    /// live. Returns [`OutOfMemory`][PoolError::OutOfMemory] if the memory
    /// source is exhausted and the installed out-of-memory handler returned.
    ///
    /// If the memory source is exhausted and **no** handler is installed, the
    /// failure is fatal to the process (via [`std::alloc::handle_alloc_error`]).
    /// Pool allocators exist to free calling code from per-allocation error
    /// handling, so opting into recoverable exhaustion is an explicit choice
    /// made by installing a handler.
    ///
    /// # Safety of using the region
    ///
    /// The returned pointer is valid for reads and writes of `size` bytes for
    /// the pool's lifetime. It is the caller's responsibility not to touch the
    /// region after the pool is destroyed or cleared; the handle-validation
    /// machinery cannot protect raw pointers that have already been handed out.
    pub fn allocate(&mut self, pool: PoolHandle, size: usize) -> Result<NonNull<[u8]>> {
        self.ensure_live(pool)?;

        let Some(request) = NonZero::new(size) else {
            return Ok(empty_region());
        };

        let index = pool.index();

        // Fast path: bump into the pool's current slab.
        {
            let node = self.occupied_node_mut(index);

            if let Some(region) = node
                .slabs
                .last_mut()
                .and_then(|slab| slab.try_allocate(request))
            {
                // Cannot overflow: counts bytes actually provided by the
                // memory source, which is bounded by the address space.
                node.allocated_bytes = node.allocated_bytes.wrapping_add(size);
                return Ok(region);
            }
        }

        // Slow path: acquire a new slab sized for the request, with a floor.
        let capacity = cmp::max(request, self.min_slab_bytes);

        let Some(mut slab) = Slab::acquire(&mut *self.memory, capacity) else {
            return Err(self.report_out_of_memory(size, capacity));
        };

        let region = slab
            .try_allocate(request)
            .expect("a fresh slab is sized to fit the request that triggered it");

        let node = self.occupied_node_mut(index);
        node.slabs.push(slab);
        // Cannot overflow: counts bytes actually provided by the memory
        // source, which is bounded by the address space.
        node.allocated_bytes = node.allocated_bytes.wrapping_add(size);

        Ok(region)
    }

    /// Allocates `size` bytes from the pool and zeroes them.
    ///
    /// Identical to [`allocate`][Self::allocate] in every other respect.
    ///
    /// # Errors
    ///
    /// As for [`allocate`][Self::allocate].
    pub fn allocate_zeroed(&mut self, pool: PoolHandle, size: usize) -> Result<NonNull<[u8]>> {
        let region = self.allocate(pool, size)?;

        // SAFETY: allocate() returned a region valid for writes of `size`
        // bytes, which is exactly what we zero.
        unsafe {
            region.cast::<u8>().as_ptr().write_bytes(0, size);
        }

        Ok(region)
    }

    /// Registers a cleanup callback that runs when the pool is destroyed or
    /// cleared, after all child pools have been torn down.
    ///
    /// Callbacks run in reverse-registration order: the most recently
    /// registered callback runs first, mirroring acquisition order. A callback
    /// that reports failure does not prevent the remaining callbacks from
    /// running; failures are collected and reported together as
    /// [`CleanupFailed`][PoolError::CleanupFailed].
    ///
    /// The returned token can be used to [`unregister_cleanup`][Self::unregister_cleanup]
    /// or [`run_cleanup`][Self::run_cleanup] the callback before teardown.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if the pool is not
    /// live.
    ///
    /// # Examples
    ///
    /// ```
    /// use cascade_pool::PoolForest;
    ///
    /// let mut forest = PoolForest::new();
    /// let pool = forest.create_root();
    ///
    /// forest
    ///     .register_cleanup(pool, || {
    ///         // Release a resource whose lifetime is tied to the pool.
    ///         Ok(())
    ///     })
    ///     .expect("pool is live");
    ///
    /// forest.destroy(pool).expect("cleanup succeeds");
    /// ```
    pub fn register_cleanup<F>(&mut self, pool: PoolHandle, callback: F) -> Result<CleanupToken>
    where
        F: FnOnce() -> CleanupResult + Send + 'static,
    {
        self.register_with_phase(pool, CleanupPhase::AfterChildren, Box::new(callback))
    }

    /// Registers a cleanup callback that runs when the pool is destroyed or
    /// cleared, **before** any child pool is torn down.
    ///
    /// For resources that must be retired while the subtree is still intact.
    /// Within this phase the order is also reverse-registration.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if the pool is not
    /// live.
    pub fn register_pre_cleanup<F>(&mut self, pool: PoolHandle, callback: F) -> Result<CleanupToken>
    where
        F: FnOnce() -> CleanupResult + Send + 'static,
    {
        self.register_with_phase(pool, CleanupPhase::BeforeChildren, Box::new(callback))
    }

    fn register_with_phase(
        &mut self,
        pool: PoolHandle,
        phase: CleanupPhase,
        callback: CleanupFn,
    ) -> Result<CleanupToken> {
        self.ensure_live(pool)?;

        let node = self.occupied_node_mut(pool.index());

        let serial = node.next_cleanup_serial;
        // Cannot overflow: one increment per registration.
        node.next_cleanup_serial = node.next_cleanup_serial.wrapping_add(1);

        node.cleanups.push(CleanupEntry::new(serial, phase, callback));

        Ok(CleanupToken::from_parts(pool, serial))
    }

    /// Removes a registered cleanup callback without running it.
    ///
    /// Use this when the resource has already been released through another
    /// path and the callback must not run during teardown.
    ///
    /// # Errors
    ///
    /// Returns [`StaleCleanupToken`][PoolError::StaleCleanupToken] if the
    /// callback already ran or was already removed, and
    /// [`InvalidHandle`][PoolError::InvalidHandle] if the pool itself is no
    /// longer live (its callbacks have run with it).
    pub fn unregister_cleanup(&mut self, token: CleanupToken) -> Result<()> {
        let entry = self.remove_cleanup_entry(token)?;
        drop(entry);
        Ok(())
    }

    /// Runs a registered cleanup callback immediately and removes it.
    ///
    /// The callback will consequently not run again during teardown.
    ///
    /// # Errors
    ///
    /// Returns the callback's failure as
    /// [`CleanupFailed`][PoolError::CleanupFailed]. Token and handle staleness
    /// are reported as for [`unregister_cleanup`][Self::unregister_cleanup].
    pub fn run_cleanup(&mut self, token: CleanupToken) -> Result<()> {
        let entry = self.remove_cleanup_entry(token)?;
        let serial = entry.serial();

        match entry.run() {
            Ok(()) => Ok(()),
            Err(error) => Err(PoolError::CleanupFailed {
                failures: vec![CleanupFailure::new(token.pool(), serial, error)],
            }),
        }
    }

    fn remove_cleanup_entry(&mut self, token: CleanupToken) -> Result<CleanupEntry> {
        let pool = token.pool();
        self.ensure_live(pool)?;

        let node = self.occupied_node_mut(pool.index());

        let position = node
            .cleanups
            .iter()
            .position(|entry| entry.serial() == token.serial())
            .ok_or(PoolError::StaleCleanupToken {
                handle: pool,
                token_serial: token.serial(),
            })?;

        Ok(node.cleanups.remove(position))
    }

    /// Destroys the pool and its entire subtree.
    ///
    /// Teardown order is total and deterministic:
    ///
    /// 1. The pool's pre-cleanup callbacks run, reverse-registration order.
    /// 2. Child pools are destroyed recursively in creation order; each
    ///    child's teardown completes before the next child's begins.
    /// 3. The pool's cleanup callbacks run, reverse-registration order.
    /// 4. The pool is unlinked from its parent (or the root list) and all of
    ///    its slabs return to the memory source.
    ///
    /// Failing callbacks never interrupt teardown; every callback in the
    /// subtree runs and all memory is reclaimed regardless.
    ///
    /// # Errors
    ///
    /// Returns [`DoubleDestroy`][PoolError::DoubleDestroy] if the pool behind
    /// the handle was already destroyed - a dangling handle is a bug in the
    /// calling code, reported rather than ignored.
    /// Returns [`ReentrantDestroy`][PoolError::ReentrantDestroy] if the pool's
    /// teardown is already in progress (observable after a cleanup callback
    /// panicked mid-teardown).
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if the handle never
    /// belonged to this forest.
    /// Returns [`CleanupFailed`][PoolError::CleanupFailed] carrying every
    /// callback failure collected during the (completed) teardown.
    pub fn destroy(&mut self, pool: PoolHandle) -> Result<()> {
        match self.classify(pool) {
            HandleState::Live => {}
            HandleState::TearingDown => {
                return Err(PoolError::ReentrantDestroy { handle: pool });
            }
            HandleState::Destroyed => return Err(PoolError::DoubleDestroy { handle: pool }),
            HandleState::Foreign => return Err(PoolError::InvalidHandle { handle: pool }),
        }

        self.occupied_node_mut(pool.index()).state = PoolState::TearingDown;

        let mut failures = Vec::new();
        self.teardown_subtree(pool, &mut failures);
        self.unlink(pool);
        self.retire_slot(pool.index());

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::CleanupFailed { failures })
        }
    }

    /// Destroys all children and runs all cleanup callbacks, exactly as
    /// [`destroy`][Self::destroy] does, but keeps the pool itself alive.
    ///
    /// Afterwards the pool is empty and reusable: the same handle remains
    /// valid, new allocations draw fresh slabs, and previously issued cleanup
    /// tokens are stale. All slabs are returned to the memory source.
    ///
    /// # Errors
    ///
    /// As for [`destroy`][Self::destroy], except that a handle to an
    /// already-destroyed pool is reported as
    /// [`InvalidHandle`][PoolError::InvalidHandle].
    pub fn clear(&mut self, pool: PoolHandle) -> Result<()> {
        match self.classify(pool) {
            HandleState::Live => {}
            HandleState::TearingDown => {
                return Err(PoolError::ReentrantDestroy { handle: pool });
            }
            HandleState::Destroyed | HandleState::Foreign => {
                return Err(PoolError::InvalidHandle { handle: pool });
            }
        }

        self.occupied_node_mut(pool.index()).state = PoolState::TearingDown;

        let mut failures = Vec::new();
        self.teardown_subtree(pool, &mut failures);

        self.occupied_node_mut(pool.index()).state = PoolState::Live;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::CleanupFailed { failures })
        }
    }

    /// Tears down every remaining root pool, in creation order, and consumes
    /// the forest.
    ///
    /// Dropping the forest performs the same teardown but has nowhere to
    /// report callback failures; call `terminate` when you care about them.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupFailed`][PoolError::CleanupFailed] carrying every
    /// callback failure collected across all roots. Teardown always completes
    /// regardless.
    pub fn terminate(mut self) -> Result<()> {
        let mut failures = Vec::new();
        self.teardown_roots(&mut failures);
        self.release_stragglers();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::CleanupFailed { failures })
        }
    }

    /// Installs the out-of-memory handler, replacing any previous one.
    ///
    /// The handler is invoked when the memory source cannot provide a slab;
    /// after it returns, the failing allocation call reports
    /// [`OutOfMemory`][PoolError::OutOfMemory]. The handler runs on the thread
    /// that attempted the allocation and must not attempt to allocate from the
    /// failed pool.
    pub fn set_oom_handler<F>(&mut self, handler: F)
    where
        F: FnMut(AllocationFailure) + Send + 'static,
    {
        self.oom_handler = Some(Box::new(handler));
    }

    /// Removes the installed out-of-memory handler, making slab acquisition
    /// failure fatal again.
    pub fn clear_oom_handler(&mut self) {
        self.oom_handler = None;
    }

    /// Returns the parent of the pool, or `None` for a root pool.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if the handle does
    /// not refer to a pool in this forest.
    pub fn parent_of(&self, pool: PoolHandle) -> Result<Option<PoolHandle>> {
        Ok(self.resolve_node(pool)?.parent())
    }

    /// Returns whether `ancestor` is on the parent chain of `descendant`.
    ///
    /// A pool counts as its own ancestor.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if either handle
    /// does not refer to a pool in this forest.
    pub fn is_ancestor(&self, ancestor: PoolHandle, descendant: PoolHandle) -> Result<bool> {
        // Validate the ancestor up front; the walk below validates the rest.
        self.resolve_node(ancestor)?;

        let mut current = Some(descendant);

        while let Some(handle) = current {
            let node = self.resolve_node(handle)?;

            if handle == ancestor {
                return Ok(true);
            }

            current = node.parent();
        }

        Ok(false)
    }

    /// Returns the number of live children of the pool.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if the handle does
    /// not refer to a pool in this forest.
    pub fn child_count(&self, pool: PoolHandle) -> Result<usize> {
        Ok(self.resolve_node(pool)?.children.len())
    }

    /// Returns the number of slabs the pool currently owns.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if the handle does
    /// not refer to a pool in this forest.
    pub fn slab_count(&self, pool: PoolHandle) -> Result<usize> {
        Ok(self.resolve_node(pool)?.slabs.len())
    }

    /// Returns the payload bytes the pool has handed out since it was created
    /// or last cleared. Alignment padding and slab overcapacity are not
    /// counted.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if the handle does
    /// not refer to a pool in this forest.
    pub fn allocated_bytes(&self, pool: PoolHandle) -> Result<usize> {
        Ok(self.resolve_node(pool)?.allocated_bytes)
    }

    /// Attaches a diagnostic label to the pool, replacing any previous one.
    ///
    /// Labels are readable back via [`label`][Self::label] and are otherwise
    /// inert; they exist so that calling code can identify pools in its own
    /// diagnostics. They survive [`clear`][Self::clear].
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if the handle does
    /// not refer to a pool in this forest.
    pub fn set_label(&mut self, pool: PoolHandle, label: &'static str) -> Result<()> {
        self.resolve_node_mut(pool)?.label = Some(label);
        Ok(())
    }

    /// Returns the pool's diagnostic label, if one was set.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHandle`][PoolError::InvalidHandle] if the handle does
    /// not refer to a pool in this forest.
    pub fn label(&self, pool: PoolHandle) -> Result<Option<&'static str>> {
        Ok(self.resolve_node(pool)?.label)
    }

    /// Returns whether the handle refers to a live pool in this forest.
    ///
    /// Stale, foreign and mid-teardown handles all report `false`.
    #[must_use]
    pub fn is_live(&self, pool: PoolHandle) -> bool {
        matches!(self.classify(pool), HandleState::Live)
    }

    /// Returns the number of pools currently in the forest, including pools
    /// whose teardown is in progress.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Trivial arithmetic; mutation just inverts the bookkeeping.
    pub fn pool_count(&self) -> usize {
        // Cannot underflow: the free list only holds indexes of slots.
        self.slots.len().wrapping_sub(self.free_slot_indexes.len())
    }

    /// Returns the root pools in creation order.
    #[must_use]
    pub fn roots(&self) -> &[PoolHandle] {
        &self.roots
    }

    /// Returns the configured slab capacity floor.
    #[must_use]
    pub fn min_slab_bytes(&self) -> NonZero<usize> {
        self.min_slab_bytes
    }

    fn insert_node(&mut self, node: PoolNode) -> PoolHandle {
        if let Some(index) = self.free_slot_indexes.pop() {
            let slot = self
                .slots
                .get_mut(index)
                .expect("free list only holds indexes of existing slots");

            debug_assert!(slot.node.is_none(), "free list entry points at an occupied slot");

            slot.node = Some(node);
            PoolHandle::from_parts(self.forest_id, index, slot.generation)
        } else {
            let index = self.slots.len();
            self.slots.push(PoolSlot::occupied(node));
            PoolHandle::from_parts(self.forest_id, index, 0)
        }
    }

    fn classify(&self, handle: PoolHandle) -> HandleState {
        if handle.forest_id() != self.forest_id {
            return HandleState::Foreign;
        }

        let Some(slot) = self.slots.get(handle.index()) else {
            return HandleState::Foreign;
        };

        if handle.generation() < slot.generation {
            return HandleState::Destroyed;
        }

        if handle.generation() > slot.generation {
            return HandleState::Foreign;
        }

        match &slot.node {
            Some(node) if node.is_live() => HandleState::Live,
            Some(_) => HandleState::TearingDown,
            None => HandleState::Destroyed,
        }
    }

    fn ensure_live(&self, handle: PoolHandle) -> Result<()> {
        match self.classify(handle) {
            HandleState::Live => Ok(()),
            _ => Err(PoolError::InvalidHandle { handle }),
        }
    }

    fn resolve_node(&self, handle: PoolHandle) -> Result<&PoolNode> {
        if handle.forest_id() != self.forest_id {
            return Err(PoolError::InvalidHandle { handle });
        }

        let slot = self
            .slots
            .get(handle.index())
            .ok_or(PoolError::InvalidHandle { handle })?;

        if slot.generation != handle.generation() {
            return Err(PoolError::InvalidHandle { handle });
        }

        slot.node
            .as_ref()
            .ok_or(PoolError::InvalidHandle { handle })
    }

    fn resolve_node_mut(&mut self, handle: PoolHandle) -> Result<&mut PoolNode> {
        if handle.forest_id() != self.forest_id {
            return Err(PoolError::InvalidHandle { handle });
        }

        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(PoolError::InvalidHandle { handle })?;

        if slot.generation != handle.generation() {
            return Err(PoolError::InvalidHandle { handle });
        }

        slot.node
            .as_mut()
            .ok_or(PoolError::InvalidHandle { handle })
    }

    /// Accesses a node that internal bookkeeping guarantees to be occupied.
    ///
    /// Only for indexes the forest itself is holding during an operation;
    /// caller-supplied handles go through [`resolve_node`][Self::resolve_node].
    fn occupied_node_mut(&mut self, index: usize) -> &mut PoolNode {
        self.slots
            .get_mut(index)
            .expect("internal bookkeeping only holds indexes of existing slots")
            .node
            .as_mut()
            .expect("internal bookkeeping only holds indexes of occupied slots")
    }

    /// Tears down everything in the pool's subtree: pre-phase cleanups, then
    /// children (creation order, recursively), then post-phase cleanups, then
    /// slabs. The pool's own slot and parent/root link are left to the caller,
    /// which is what lets `clear` reuse this for its reset semantics.
    fn teardown_subtree(&mut self, pool: PoolHandle, failures: &mut Vec<CleanupFailure>) {
        let index = pool.index();

        let before = self
            .occupied_node_mut(index)
            .drain_cleanup_phase(CleanupPhase::BeforeChildren);
        run_cleanup_phase(pool, before, failures);

        let children = mem::take(&mut self.occupied_node_mut(index).children);
        for child in children {
            self.occupied_node_mut(child.index()).state = PoolState::TearingDown;
            self.teardown_subtree(child, failures);
            self.retire_slot(child.index());
        }

        let after = self
            .occupied_node_mut(index)
            .drain_cleanup_phase(CleanupPhase::AfterChildren);
        run_cleanup_phase(pool, after, failures);

        let slabs = {
            let node = self.occupied_node_mut(index);
            node.allocated_bytes = 0;
            mem::take(&mut node.slabs)
        };

        for slab in slabs {
            slab.release(&mut *self.memory);
        }
    }

    /// Removes the pool from its parent's child list or from the root list.
    fn unlink(&mut self, pool: PoolHandle) {
        let parent = self.occupied_node_mut(pool.index()).parent();

        match parent {
            Some(parent_handle) => {
                let children = &mut self.occupied_node_mut(parent_handle.index()).children;
                let position = children
                    .iter()
                    .position(|&child| child == pool)
                    .expect("a pool with a parent is always on that parent's child list");
                _ = children.remove(position);
            }
            None => {
                let position = self
                    .roots
                    .iter()
                    .position(|&root| root == pool)
                    .expect("a pool without a parent is always on the root list");
                _ = self.roots.remove(position);
            }
        }
    }

    /// Vacates the slot and advances its generation so every outstanding
    /// handle to the destroyed pool becomes detectably stale.
    fn retire_slot(&mut self, index: usize) {
        let slot = self
            .slots
            .get_mut(index)
            .expect("internal bookkeeping only holds indexes of existing slots");

        let node = slot
            .node
            .take()
            .expect("retire always follows teardown of an occupied slot");

        debug_assert!(
            node.slabs.is_empty(),
            "slabs must be released before the slot is retired"
        );

        // Cannot overflow: one increment per pool destruction.
        slot.generation = slot.generation.wrapping_add(1);

        self.free_slot_indexes.push(index);
    }

    fn teardown_roots(&mut self, failures: &mut Vec<CleanupFailure>) {
        for root in mem::take(&mut self.roots) {
            self.occupied_node_mut(root.index()).state = PoolState::TearingDown;
            self.teardown_subtree(root, failures);
            self.retire_slot(root.index());
        }
    }

    /// Returns slabs of pools that are no longer reachable from the root list
    /// to the memory source.
    ///
    /// A cleanup callback that panics mid-teardown can orphan part of a
    /// subtree; the memory still belongs to the forest and still has to go
    /// back to the source when the forest ends.
    fn release_stragglers(&mut self) {
        for index in 0..self.slots.len() {
            let slabs = {
                let Some(slot) = self.slots.get_mut(index) else {
                    continue;
                };
                let Some(node) = slot.node.as_mut() else {
                    continue;
                };
                mem::take(&mut node.slabs)
            };

            for slab in slabs {
                slab.release(&mut *self.memory);
            }
        }
    }

    fn report_out_of_memory(
        &mut self,
        requested_bytes: usize,
        slab_bytes: NonZero<usize>,
    ) -> PoolError {
        let failure = AllocationFailure::new(requested_bytes, slab_bytes.get());

        match self.oom_handler.as_mut() {
            Some(handler) => {
                handler(failure);
                PoolError::OutOfMemory { requested_bytes }
            }
            None => {
                let layout = Layout::from_size_align(slab_bytes.get(), ALLOCATION_ALIGNMENT.get())
                    .expect("slab layout was already valid when acquisition was attempted");

                // Documented contract: without a handler, exhaustion is fatal.
                std::alloc::handle_alloc_error(layout)
            }
        }
    }
}

impl Default for PoolForest {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PoolForest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolForest")
            .field("forest_id", &self.forest_id)
            .field("pool_count", &self.pool_count())
            .field("roots", &self.roots)
            .field("min_slab_bytes", &self.min_slab_bytes)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl Drop for PoolForest {
    fn drop(&mut self) {
        let mut failures = Vec::new();
        self.teardown_roots(&mut failures);
        self.release_stragglers();
        // Nowhere to report the failures from here; terminate() exists for
        // callers that want them.
        drop(failures);
    }
}

/// Runs one phase's entries in reverse-registration order, collecting
/// failures: the resource acquired last is released first, and one broken
/// callback never prevents the others from running.
fn run_cleanup_phase(
    pool: PoolHandle,
    entries: Vec<CleanupEntry>,
    failures: &mut Vec<CleanupFailure>,
) {
    for entry in entries.into_iter().rev() {
        let serial = entry.serial();

        if let Err(error) = entry.run() {
            failures.push(CleanupFailure::new(pool, serial, error));
        }
    }
}

/// A valid zero-length region for zero-byte allocation requests.
///
/// Aligned like every other region the forest hands out, so callers can apply
/// uniform alignment assumptions without special-casing empty regions.
fn empty_region() -> NonNull<[u8]> {
    let base = std::ptr::without_provenance_mut::<u8>(ALLOCATION_ALIGNMENT.get());

    let base = NonNull::new(base).expect("the allocation alignment is a non-zero address");

    NonNull::slice_from_raw_parts(base, 0)
}

#[cfg(test)]
#[allow(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same rigor as production code"
)]
mod tests {
    use std::fmt::Debug;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{MemorySource, SystemMemorySource, TrackingMemorySource};

    assert_impl_all!(PoolForest: Send, Debug, Default);
    assert_not_impl_any!(PoolForest: Sync);
    assert_impl_all!(AllocationFailure: Copy, Debug, Send, Sync);

    /// Shared log that cleanup callbacks append to, for asserting on
    /// execution order.
    #[derive(Clone, Debug, Default)]
    struct TeardownLog {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl TeardownLog {
        fn recorder(&self, event: &'static str) -> impl FnOnce() -> CleanupResult + Send + 'static {
            let events = Arc::clone(&self.events);
            move || {
                events.lock().expect("log mutex never poisoned").push(event);
                Ok(())
            }
        }

        fn failing_recorder(
            &self,
            event: &'static str,
        ) -> impl FnOnce() -> CleanupResult + Send + 'static {
            let events = Arc::clone(&self.events);
            move || {
                events.lock().expect("log mutex never poisoned").push(event);
                Err(format!("{event} could not be released").into())
            }
        }

        fn events(&self) -> Vec<&'static str> {
            self.events.lock().expect("log mutex never poisoned").clone()
        }
    }

    #[test]
    fn create_and_destroy_root() {
        let mut forest = PoolForest::new();

        let pool = forest.create_root();
        assert!(forest.is_live(pool));
        assert_eq!(forest.pool_count(), 1);
        assert_eq!(forest.roots(), [pool]);

        forest.destroy(pool).expect("pool is live");
        assert!(!forest.is_live(pool));
        assert_eq!(forest.pool_count(), 0);
        assert!(forest.roots().is_empty());
    }

    #[test]
    fn child_pools_know_their_parent() {
        let mut forest = PoolForest::new();

        let parent = forest.create_root();
        let child = forest.create_child(parent).expect("parent is live");
        let grandchild = forest.create_child(child).expect("child is live");

        assert_eq!(forest.parent_of(parent).unwrap(), None);
        assert_eq!(forest.parent_of(child).unwrap(), Some(parent));
        assert_eq!(forest.parent_of(grandchild).unwrap(), Some(child));

        assert_eq!(forest.child_count(parent).unwrap(), 1);
        assert_eq!(forest.child_count(child).unwrap(), 1);
        assert_eq!(forest.child_count(grandchild).unwrap(), 0);
    }

    #[test]
    fn is_ancestor_walks_the_parent_chain() {
        let mut forest = PoolForest::new();

        let root = forest.create_root();
        let child = forest.create_child(root).expect("root is live");
        let grandchild = forest.create_child(child).expect("child is live");
        let other_root = forest.create_root();

        assert!(forest.is_ancestor(root, grandchild).unwrap());
        assert!(forest.is_ancestor(child, grandchild).unwrap());
        assert!(forest.is_ancestor(root, root).unwrap());
        assert!(!forest.is_ancestor(grandchild, root).unwrap());
        assert!(!forest.is_ancestor(other_root, grandchild).unwrap());
    }

    #[test]
    fn allocate_returns_writable_region_of_requested_length() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        let region = forest.allocate(pool, 100).expect("pool is live");
        assert_eq!(region.len(), 100);

        // SAFETY: The region is valid for writes of its full length until the
        // pool is destroyed.
        unsafe {
            region.cast::<u8>().as_ptr().write_bytes(0x5A, region.len());
        }

        assert_eq!(forest.allocated_bytes(pool).unwrap(), 100);

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn allocate_zeroed_zeroes_the_region() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        let region = forest.allocate_zeroed(pool, 64).expect("pool is live");

        // SAFETY: The region is valid for reads of its full length and was
        // just initialized by allocate_zeroed.
        let contents = unsafe {
            std::slice::from_raw_parts(region.cast::<u8>().as_ptr(), region.len())
        };
        assert!(contents.iter().all(|&byte| byte == 0));

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn zero_byte_allocation_consumes_no_slab() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        let region = forest.allocate(pool, 0).expect("pool is live");
        assert_eq!(region.len(), 0);
        assert_eq!(forest.slab_count(pool).unwrap(), 0);
        assert_eq!(forest.allocated_bytes(pool).unwrap(), 0);

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn small_allocations_share_one_slab() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        for _ in 0..10 {
            _ = forest.allocate(pool, 32).expect("pool is live");
        }

        assert_eq!(forest.slab_count(pool).unwrap(), 1);
        assert_eq!(forest.allocated_bytes(pool).unwrap(), 320);

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn oversized_request_gets_dedicated_slab() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        let floor = forest.min_slab_bytes().get();

        _ = forest.allocate(pool, 16).expect("pool is live");
        _ = forest.allocate(pool, floor * 4).expect("pool is live");

        assert_eq!(forest.slab_count(pool).unwrap(), 2);

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn slab_floor_is_configurable() {
        let source = TrackingMemorySource::system();
        let stats = source.stats();

        let mut forest = PoolForest::builder()
            .min_slab_bytes(nz!(1024))
            .memory_source(source)
            .build();
        let pool = forest.create_root();

        _ = forest.allocate(pool, 1).expect("pool is live");

        assert_eq!(stats.acquired_bytes(), 1024);

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn destroy_runs_cleanups_in_reverse_registration_order() {
        let log = TeardownLog::default();
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        forest.register_cleanup(pool, log.recorder("first")).unwrap();
        forest.register_cleanup(pool, log.recorder("second")).unwrap();
        forest.register_cleanup(pool, log.recorder("third")).unwrap();

        forest.destroy(pool).expect("cleanups succeed");

        assert_eq!(log.events(), ["third", "second", "first"]);
    }

    #[test]
    fn destroy_tears_down_children_before_own_cleanups_in_creation_order() {
        let log = TeardownLog::default();
        let mut forest = PoolForest::new();

        let parent = forest.create_root();
        let first_child = forest.create_child(parent).expect("parent is live");
        let second_child = forest.create_child(parent).expect("parent is live");
        let grandchild = forest.create_child(first_child).expect("child is live");

        forest.register_cleanup(parent, log.recorder("parent")).unwrap();
        forest
            .register_cleanup(first_child, log.recorder("first_child"))
            .unwrap();
        forest
            .register_cleanup(second_child, log.recorder("second_child"))
            .unwrap();
        forest
            .register_cleanup(grandchild, log.recorder("grandchild"))
            .unwrap();

        forest.destroy(parent).expect("cleanups succeed");

        // Depth-first, creation order, children complete before the parent's
        // own cleanups run.
        assert_eq!(
            log.events(),
            ["grandchild", "first_child", "second_child", "parent"]
        );

        // The whole subtree is gone.
        assert!(!forest.is_live(parent));
        assert!(!forest.is_live(first_child));
        assert!(!forest.is_live(second_child));
        assert!(!forest.is_live(grandchild));
        assert_eq!(forest.pool_count(), 0);
    }

    #[test]
    fn pre_cleanups_run_before_child_teardown() {
        let log = TeardownLog::default();
        let mut forest = PoolForest::new();

        let parent = forest.create_root();
        let child = forest.create_child(parent).expect("parent is live");

        forest.register_cleanup(child, log.recorder("child")).unwrap();
        forest
            .register_cleanup(parent, log.recorder("parent_after"))
            .unwrap();
        forest
            .register_pre_cleanup(parent, log.recorder("parent_before"))
            .unwrap();

        forest.destroy(parent).expect("cleanups succeed");

        assert_eq!(log.events(), ["parent_before", "child", "parent_after"]);
    }

    #[test]
    fn failing_cleanup_does_not_stop_the_others() {
        let log = TeardownLog::default();
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        // Registration order: a (fails), b, c. Execution must be c, b, a.
        forest
            .register_cleanup(pool, log.failing_recorder("a"))
            .unwrap();
        forest.register_cleanup(pool, log.recorder("b")).unwrap();
        forest.register_cleanup(pool, log.recorder("c")).unwrap();

        let error = forest.destroy(pool).expect_err("one cleanup fails");

        assert_eq!(log.events(), ["c", "b", "a"]);

        let PoolError::CleanupFailed { failures } = error else {
            panic!("expected CleanupFailed, got {error:?}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].pool(), pool);
        assert!(failures[0].error().to_string().contains('a'));

        // Teardown completed despite the failure.
        assert!(!forest.is_live(pool));
    }

    #[test]
    fn failures_are_collected_across_the_whole_subtree() {
        let log = TeardownLog::default();
        let mut forest = PoolForest::new();

        let parent = forest.create_root();
        let child = forest.create_child(parent).expect("parent is live");

        forest
            .register_cleanup(child, log.failing_recorder("child"))
            .unwrap();
        forest
            .register_cleanup(parent, log.failing_recorder("parent"))
            .unwrap();

        let error = forest.destroy(parent).expect_err("both cleanups fail");

        let PoolError::CleanupFailed { failures } = error else {
            panic!("expected CleanupFailed, got {error:?}");
        };
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].pool(), child);
        assert_eq!(failures[1].pool(), parent);
    }

    #[test]
    fn double_destroy_is_reported() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        forest.destroy(pool).expect("pool is live");

        let error = forest.destroy(pool).expect_err("pool is gone");
        assert!(matches!(error, PoolError::DoubleDestroy { handle } if handle == pool));
    }

    #[test]
    fn destroying_parent_stales_child_handles() {
        let mut forest = PoolForest::new();
        let parent = forest.create_root();
        let child = forest.create_child(parent).expect("parent is live");

        forest.destroy(parent).expect("parent is live");

        // The child was destroyed transitively; its handle now reports that.
        let error = forest.destroy(child).expect_err("child is gone");
        assert!(matches!(error, PoolError::DoubleDestroy { .. }));
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let mut forest_a = PoolForest::new();
        let mut forest_b = PoolForest::new();

        let pool_a = forest_a.create_root();
        // Occupies the same slot index in its own forest.
        let pool_b = forest_b.create_root();
        assert!(forest_b.is_live(pool_b));

        let error = forest_b.allocate(pool_a, 16).expect_err("foreign handle");
        assert!(matches!(error, PoolError::InvalidHandle { .. }));

        let error = forest_b.destroy(pool_a).expect_err("foreign handle");
        assert!(matches!(error, PoolError::InvalidHandle { .. }));

        forest_a.destroy(pool_a).expect("pool is live");
    }

    #[test]
    fn operations_on_destroyed_pool_report_invalid_handle() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        forest.destroy(pool).expect("pool is live");

        assert!(matches!(
            forest.allocate(pool, 8),
            Err(PoolError::InvalidHandle { .. })
        ));
        assert!(matches!(
            forest.create_child(pool),
            Err(PoolError::InvalidHandle { .. })
        ));
        assert!(matches!(
            forest.register_cleanup(pool, || Ok(())),
            Err(PoolError::InvalidHandle { .. })
        ));
        assert!(matches!(
            forest.clear(pool),
            Err(PoolError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn clear_resets_the_pool_but_keeps_the_handle_valid() {
        let log = TeardownLog::default();
        let mut forest = PoolForest::new();

        let pool = forest.create_root();
        let child = forest.create_child(pool).expect("pool is live");

        _ = forest.allocate(pool, 128).expect("pool is live");
        forest.register_cleanup(pool, log.recorder("own")).unwrap();
        forest.register_cleanup(child, log.recorder("child")).unwrap();

        forest.clear(pool).expect("cleanups succeed");

        // Children gone, cleanups ran in the same order destroy would use.
        assert_eq!(log.events(), ["child", "own"]);
        assert!(!forest.is_live(child));
        assert_eq!(forest.child_count(pool).unwrap(), 0);
        assert_eq!(forest.slab_count(pool).unwrap(), 0);
        assert_eq!(forest.allocated_bytes(pool).unwrap(), 0);

        // The pool itself is still live and usable.
        assert!(forest.is_live(pool));
        assert_eq!(forest.roots(), [pool]);
        let region = forest.allocate(pool, 64).expect("handle stays valid");
        assert_eq!(region.len(), 64);

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn clear_returns_slab_memory_to_the_source() {
        let source = TrackingMemorySource::system();
        let stats = source.stats();

        let mut forest = PoolForest::builder().memory_source(source).build();
        let pool = forest.create_root();

        _ = forest.allocate(pool, 4096).expect("pool is live");
        assert!(stats.outstanding_bytes() > 0);

        forest.clear(pool).expect("pool is live");
        assert_eq!(stats.outstanding_bytes(), 0);

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn tokens_issued_before_clear_are_stale_afterwards() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        let token = forest.register_cleanup(pool, || Ok(())).unwrap();
        forest.clear(pool).expect("cleanup succeeds");

        let error = forest
            .unregister_cleanup(token)
            .expect_err("the entry already ran");
        assert!(matches!(error, PoolError::StaleCleanupToken { .. }));

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn unregistered_cleanup_does_not_run() {
        let log = TeardownLog::default();
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        let keep = forest.register_cleanup(pool, log.recorder("keep")).unwrap();
        let remove = forest
            .register_cleanup(pool, log.recorder("removed"))
            .unwrap();
        assert_ne!(keep, remove);

        forest.unregister_cleanup(remove).expect("entry is registered");

        forest.destroy(pool).expect("cleanup succeeds");

        assert_eq!(log.events(), ["keep"]);
    }

    #[test]
    fn unregistering_twice_reports_stale_token() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        let token = forest.register_cleanup(pool, || Ok(())).unwrap();

        forest.unregister_cleanup(token).expect("entry is registered");

        let error = forest
            .unregister_cleanup(token)
            .expect_err("entry is already gone");
        assert!(matches!(
            error,
            PoolError::StaleCleanupToken { token_serial: 0, .. }
        ));

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn run_cleanup_executes_immediately_and_removes_the_entry() {
        let log = TeardownLog::default();
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        let token = forest.register_cleanup(pool, log.recorder("early")).unwrap();

        forest.run_cleanup(token).expect("callback succeeds");
        assert_eq!(log.events(), ["early"]);

        // Running it again is stale, and teardown does not run it either.
        assert!(matches!(
            forest.run_cleanup(token),
            Err(PoolError::StaleCleanupToken { .. })
        ));

        forest.destroy(pool).expect("pool is live");
        assert_eq!(log.events(), ["early"]);
    }

    #[test]
    fn run_cleanup_surfaces_the_callback_failure() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        let token = forest
            .register_cleanup(pool, || Err("still in use".into()))
            .unwrap();

        let error = forest.run_cleanup(token).expect_err("callback fails");
        let PoolError::CleanupFailed { failures } = error else {
            panic!("expected CleanupFailed, got {error:?}");
        };
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error().to_string().contains("still in use"));

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn destroy_returns_all_memory_to_the_source() {
        let source = TrackingMemorySource::system();
        let stats = source.stats();

        let mut forest = PoolForest::builder().memory_source(source).build();

        let parent = forest.create_root();
        let child = forest.create_child(parent).expect("parent is live");

        _ = forest.allocate(parent, 10_000).expect("parent is live");
        _ = forest.allocate(child, 123).expect("child is live");
        _ = forest.allocate(child, 40_000).expect("child is live");

        assert!(stats.outstanding_bytes() > 0);

        forest.destroy(parent).expect("pools are live");

        // Everything came back, exactly once.
        assert_eq!(stats.outstanding_bytes(), 0);
        assert_eq!(stats.acquire_count(), stats.release_count());
    }

    #[test]
    fn dropping_the_forest_returns_all_memory_to_the_source() {
        let source = TrackingMemorySource::system();
        let stats = source.stats();

        {
            let mut forest = PoolForest::builder().memory_source(source).build();

            let first_root = forest.create_root();
            let second_root = forest.create_root();
            let child = forest.create_child(first_root).expect("root is live");

            _ = forest.allocate(first_root, 512).expect("root is live");
            _ = forest.allocate(second_root, 512).expect("root is live");
            _ = forest.allocate(child, 512).expect("child is live");
        }

        assert_eq!(stats.outstanding_bytes(), 0);
        assert_eq!(stats.acquire_count(), stats.release_count());
    }

    #[test]
    fn terminate_destroys_roots_in_creation_order() {
        let log = TeardownLog::default();
        let mut forest = PoolForest::new();

        let first = forest.create_root();
        let second = forest.create_root();
        let third = forest.create_root();

        forest.register_cleanup(first, log.recorder("first")).unwrap();
        forest.register_cleanup(second, log.recorder("second")).unwrap();
        forest.register_cleanup(third, log.recorder("third")).unwrap();

        forest.terminate().expect("cleanups succeed");

        assert_eq!(log.events(), ["first", "second", "third"]);
    }

    #[test]
    fn terminate_reports_collected_failures() {
        let log = TeardownLog::default();
        let mut forest = PoolForest::new();

        let first = forest.create_root();
        let second = forest.create_root();

        forest
            .register_cleanup(first, log.failing_recorder("first"))
            .unwrap();
        forest.register_cleanup(second, log.recorder("second")).unwrap();

        let error = forest.terminate().expect_err("one cleanup fails");

        // Both roots were torn down regardless of the failure.
        assert_eq!(log.events(), ["first", "second"]);
        assert!(matches!(error, PoolError::CleanupFailed { failures } if failures.len() == 1));
    }

    #[test]
    fn oom_handler_is_invoked_and_allocation_reports_out_of_memory() {
        /// Refuses everything: models an exhausted system allocator.
        #[derive(Debug)]
        struct ExhaustedSource;

        impl MemorySource for ExhaustedSource {
            fn acquire(&mut self, _layout: Layout) -> Option<NonNull<u8>> {
                None
            }

            unsafe fn release(&mut self, _region: NonNull<u8>, _layout: Layout) {
                unreachable!("nothing was ever acquired from this source");
            }
        }

        let invocations = Arc::new(AtomicUsize::new(0));
        let seen_request = Arc::new(AtomicUsize::new(0));

        let handler_invocations = Arc::clone(&invocations);
        let handler_request = Arc::clone(&seen_request);

        let mut forest = PoolForest::builder()
            .memory_source(ExhaustedSource)
            .oom_handler(move |failure| {
                handler_invocations.fetch_add(1, Ordering::Relaxed);
                handler_request.store(failure.requested_bytes(), Ordering::Relaxed);
            })
            .build();

        let pool = forest.create_root();

        let error = forest.allocate(pool, 99).expect_err("source is exhausted");

        assert!(matches!(
            error,
            PoolError::OutOfMemory { requested_bytes: 99 }
        ));
        assert_eq!(invocations.load(Ordering::Relaxed), 1);
        assert_eq!(seen_request.load(Ordering::Relaxed), 99);

        // The pool itself is unharmed; a handle-level error, not corruption.
        assert!(forest.is_live(pool));
        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn panicking_cleanup_poisons_the_pool_as_reentrant() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        _ = forest.allocate(pool, 64).expect("pool is live");
        forest
            .register_cleanup(pool, || panic!("cleanup callback panicked"))
            .unwrap();

        let panicked = catch_unwind(AssertUnwindSafe(|| forest.destroy(pool)));
        assert!(panicked.is_err());

        // The interrupted teardown is detected instead of being resumed on a
        // half-dismantled pool.
        let error = forest.destroy(pool).expect_err("pool is poisoned");
        assert!(matches!(error, PoolError::ReentrantDestroy { handle } if handle == pool));

        let error = forest.clear(pool).expect_err("pool is poisoned");
        assert!(matches!(error, PoolError::ReentrantDestroy { .. }));

        // Not live, but also not destroyed: new work is refused.
        assert!(!forest.is_live(pool));
        assert!(matches!(
            forest.create_child(pool),
            Err(PoolError::InvalidHandle { .. })
        ));

        // Dropping the forest still reclaims the poisoned pool's memory; the
        // absence of a Slab drop panic here is the assertion.
    }

    #[test]
    fn independent_forests_on_separate_threads_do_not_interfere() {
        let workers: Vec<_> = (0..2)
            .map(|_| {
                thread::spawn(|| {
                    let source = TrackingMemorySource::system();
                    let stats = source.stats();

                    let mut forest = PoolForest::builder().memory_source(source).build();

                    let root = forest.create_root();
                    for _ in 0..100 {
                        let child = forest.create_child(root).expect("root is live");
                        _ = forest.allocate(child, 1000).expect("child is live");
                        forest.destroy(child).expect("child is live");
                    }

                    forest.destroy(root).expect("root is live");

                    (stats.acquire_count(), stats.release_count(), stats.outstanding_bytes())
                })
            })
            .collect();

        for worker in workers {
            let (acquires, releases, outstanding) =
                worker.join().expect("worker thread completed");

            assert_eq!(acquires, releases);
            assert_eq!(outstanding, 0);
        }
    }

    #[test]
    fn forests_are_thread_mobile() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        let handle = thread::spawn(move || {
            _ = forest.allocate(pool, 32).expect("pool is live");
            forest.destroy(pool).expect("pool is live");
        });

        handle.join().expect("worker thread completed");
    }

    #[test]
    fn labels_are_stored_and_survive_clear() {
        let mut forest = PoolForest::new();
        let pool = forest.create_root();

        assert_eq!(forest.label(pool).unwrap(), None);

        forest.set_label(pool, "request").expect("pool is live");
        assert_eq!(forest.label(pool).unwrap(), Some("request"));

        forest.clear(pool).expect("pool is live");
        assert_eq!(forest.label(pool).unwrap(), Some("request"));

        forest.destroy(pool).expect("pool is live");
    }

    #[test]
    fn slots_are_reused_without_resurrecting_old_handles() {
        let mut forest = PoolForest::new();

        let first = forest.create_root();
        forest.destroy(first).expect("pool is live");

        // The slot is reused for the next pool...
        let second = forest.create_root();
        assert_eq!(forest.pool_count(), 1);

        // ...but the old handle stays dead.
        assert_ne!(first, second);
        assert!(!forest.is_live(first));
        assert!(forest.is_live(second));
        assert!(matches!(
            forest.destroy(first),
            Err(PoolError::DoubleDestroy { .. })
        ));

        forest.destroy(second).expect("pool is live");
    }

    #[test]
    fn destroying_a_middle_root_preserves_the_order_of_the_rest() {
        let mut forest = PoolForest::new();

        let first = forest.create_root();
        let second = forest.create_root();
        let third = forest.create_root();

        forest.destroy(second).expect("pool is live");

        assert_eq!(forest.roots(), [first, third]);

        forest.destroy(first).expect("pool is live");
        forest.destroy(third).expect("pool is live");
    }

    #[test]
    fn debug_output_mentions_the_pool_count() {
        let mut forest = PoolForest::new();
        _ = forest.create_root();

        let rendered = format!("{forest:?}");
        assert!(rendered.contains("PoolForest"));
        assert!(rendered.contains("pool_count"));
    }
}
