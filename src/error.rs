//! Fatal-error reporting.
//!
//! The base allocator (`zend_mm_safe_error` / `zend_mm_panic` in the source
//! this was distilled from) never returns a per-call error code for an
//! allocation failure — it longjmps out through a bailout handler. Rust has
//! no non-local control transfer to borrow for that, so this crate models
//! the bailout as an injected [`FatalReporter`] that is presumed not to
//! return (spec: "implementations in languages without non-local control
//! transfer can require the reporter to terminate the process").

/// The three fatal conditions this allocator can hit. `HeapCorruption` is
/// deliberately not a variant here: corrupted internal state is checked with
/// the [`crate::heap_check`] macro, which panics directly rather than
/// routing through a reporter (there is no sensible "continue" for a
/// corrupted heap map).
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum FatalKind {
    #[error("Allowed memory size of {limit} bytes exhausted (tried to allocate {requested} bytes)")]
    LimitExceeded { limit: usize, requested: usize },

    #[error("Out of memory (allocated {real_size}) (tried to allocate {requested} bytes)")]
    OutOfMemory { real_size: usize, requested: usize },

    #[error("Possible integer overflow in memory allocation ({nmemb} * {size})")]
    IntegerOverflow { nmemb: usize, size: usize },
}

/// A caller-supplied handler for fatal allocator conditions.
///
/// `report` is presumed not to return to its caller (the heap is about to be
/// used again by code that assumes the allocation it just asked for
/// succeeded). Implementations that can unwind may panic; implementations
/// that cannot should call [`std::process::abort`] or exit. If `report`
/// returns anyway, the allocator call it was raised from still aborts the
/// process as a backstop — it must not hand back a null/dangling pointer.
pub trait FatalReporter {
    fn report(&self, kind: FatalKind) -> !;
}

/// Default reporter: logs at `error!` and aborts the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortReporter;

impl FatalReporter for AbortReporter {
    fn report(&self, kind: FatalKind) -> ! {
        log::error!("{}", kind);
        std::process::abort();
    }
}

/// Panics with a diagnostic message describing an internal invariant
/// violation (back-pointer mismatch, unexpected page-map state, double
/// free). Matches the base spec's *HeapCorruption* policy: "panic with a
/// diagnostic message and terminate the process".
#[macro_export]
macro_rules! heap_check {
    ($cond:expr, $msg:expr) => {
        if !($cond) {
            panic!(concat!("slab_heap: heap corrupted: ", $msg));
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)+) => {
        if !($cond) {
            panic!(concat!("slab_heap: heap corrupted: ", $fmt), $($arg)+);
        }
    };
}
