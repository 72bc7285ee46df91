//! A three-tier slab/page/huge-block memory manager for single-threaded,
//! bulk-teardown runtimes.
//!
//! Allocations under [`bins::MAX_SMALL_SIZE`] bytes are served from
//! fixed-size slab bins; allocations up to a chunk's payload are served as
//! multi-page "large runs"; anything bigger is mapped as its own
//! chunk-aligned "huge block". All three tiers are carved from 2 MiB chunks
//! mapped directly from the OS (see [`os`]), and a [`gc::collect`] sweep can
//! reclaim slab pages whose every element has been freed.
//!
//! The allocator is exposed as an explicit handle, [`Heap`], rather than a
//! `#[global_allocator]`: callers that want a drop-in `GlobalAlloc` can wrap
//! one in a `RefCell`/mutex of their own, but this crate doesn't assume a
//! single process-wide heap or any particular synchronization discipline.
//! Legacy callers that do want an implicit default heap (one per thread,
//! since the allocator itself is not thread-safe) can reach for [`ambient`]
//! instead.
//!
//! ```no_run
//! use slab_heap::Heap;
//!
//! let mut heap = Heap::startup();
//! let ptr = heap.alloc(64);
//! heap.free(ptr);
//! ```

pub mod ambient;
mod bins;
mod bitset;
mod chunk;
mod config;
mod error;
mod gc;
mod heap;
mod huge;
mod os;
mod page;

pub use config::Options;
pub use error::{AbortReporter, FatalKind, FatalReporter};
pub use heap::Heap;
