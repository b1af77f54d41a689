//! A hierarchical memory pool (arena) allocator with deterministic, ordered
//! teardown.
//!
//! This crate provides [`PoolForest`], an explicitly constructed registry of
//! memory pools. Allocations are grouped into pools and reclaimed together;
//! pools form a tree, and destroying a pool deterministically destroys every
//! descendant and runs every registered cleanup callback in a well-defined
//! order before any memory is reclaimed.
//!
//! # Key Features
//!
//! - **Arena allocation**: bump-pointer allocation from slabs, no per-object
//!   free, all of a pool's memory reclaimed in one step
//! - **Pool tree**: child pools whose lifetime is bounded by their parent's;
//!   destroying a parent tears down the whole subtree
//! - **Deterministic teardown order**: children in creation order, depth-first,
//!   then the pool's own cleanup callbacks in reverse-registration order
//! - **Cleanup callbacks**: release non-memory resources (file handles, locks)
//!   when their pool goes away; failures are collected, never silently lost,
//!   and never interrupt the teardown of sibling resources
//! - **Checked handles**: [`PoolHandle`] and [`CleanupToken`] are plain
//!   copyable values; stale or foreign handles are detected and reported as
//!   typed errors, never undefined behavior
//! - **Explicit registry**: no ambient global pool - forests are constructed,
//!   terminated and dropped explicitly, so tests can run isolated forests and
//!   threads can each own one
//! - **Pluggable memory**: slab traffic flows through a
//!   [`MemorySource`], so tests and benchmarks can account for every byte with
//!   [`TrackingMemorySource`]
//! - **Out-of-memory policy**: an installable handler decides whether
//!   exhaustion is reported or fatal
//!
//! # Example
//!
//! ```rust
//! use cascade_pool::PoolForest;
//!
//! let mut forest = PoolForest::new();
//!
//! // A root pool for the lifetime of one request.
//! let request = forest.create_root();
//!
//! // A child pool for a parsing phase; freed before (and never after) the
//! // request pool itself.
//! let parser = forest.create_child(request).expect("request pool is live");
//!
//! // Bump-allocate scratch memory; individual regions are never freed.
//! let scratch = forest.allocate(parser, 4096).expect("parser pool is live");
//! assert_eq!(scratch.len(), 4096);
//!
//! // Tie resource release to the request's lifetime. Callbacks run in
//! // reverse-registration order: connection closes before the log flushes.
//! forest
//!     .register_cleanup(request, || {
//!         // flush the request log
//!         Ok(())
//!     })
//!     .expect("request pool is live");
//! forest
//!     .register_cleanup(request, || {
//!         // close the connection
//!         Ok(())
//!     })
//!     .expect("request pool is live");
//!
//! // One call tears down the parser pool, runs both callbacks and returns
//! // every slab to the memory source.
//! forest.destroy(request).expect("cleanups succeed");
//! ```
//!
//! # Teardown ordering
//!
//! The ordering guarantee is the central correctness property of the crate and
//! is total and deterministic. For `destroy(pool)` (and identically for
//! [`clear`][PoolForest::clear]):
//!
//! 1. `pool`'s pre-cleanup callbacks run, reverse-registration order.
//! 2. `pool`'s children are destroyed recursively in creation order; each
//!    child's teardown completes before the next child's begins.
//! 3. `pool`'s cleanup callbacks run, reverse-registration order - the
//!    resource acquired last is released first.
//! 4. `pool`'s slabs return to the memory source.
//!
//! # Thread safety
//!
//! A forest is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]): one
//! pool tree belongs to one thread at a time, with no internal locking.
//! Distinct forests are fully independent and may be used concurrently from
//! different threads.

mod builder;
mod cleanup;
mod error;
mod forest;
mod handle;
mod memory_source;
mod node;
mod slab;

pub use builder::PoolForestBuilder;
pub use cleanup::{CleanupFailure, CleanupPhase, CleanupResult};
pub(crate) use cleanup::{CleanupEntry, CleanupFn};
pub use error::PoolError;
pub(crate) use error::Result;
pub use forest::{AllocationFailure, PoolForest};
pub use handle::{CleanupToken, PoolHandle};
pub use memory_source::{
    MemorySource, MemorySourceStats, SystemMemorySource, TrackingMemorySource,
};
pub(crate) use memory_source::DynMemorySource;
pub(crate) use node::{PoolNode, PoolSlot, PoolState};
pub(crate) use slab::Slab;
