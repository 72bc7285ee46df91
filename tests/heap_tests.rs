//! Integration tests for the concrete scenarios and invariants the
//! allocator is expected to satisfy, exercised through the public `Heap`
//! handle only.

use slab_heap::{FatalKind, FatalReporter, Heap};
use std::panic;

/// A reporter that unwinds instead of aborting, so fatal-path tests can
/// observe the failure with `catch_unwind`/`#[should_panic]` rather than
/// killing the whole test binary.
#[derive(Debug, Default, Clone, Copy)]
struct PanicReporter;

impl FatalReporter for PanicReporter {
    fn report(&self, kind: FatalKind) -> ! {
        panic!("{}", kind);
    }
}

fn heap_for_fatal_tests() -> Heap {
    Heap::startup_with_reporter(Box::new(PanicReporter))
}

// S1 - size-class rounding.
#[test]
fn size_class_rounding() {
    let mut heap = Heap::startup();
    let p1 = heap.alloc(1);
    assert_eq!(heap.block_size(p1), 8);
    let p2 = heap.alloc(9);
    assert_eq!(heap.block_size(p2), 16);
    let p3 = heap.alloc(3072);
    assert_eq!(heap.block_size(p3), 3072);
    let p4 = heap.alloc(3073);
    assert!(heap.block_size(p4) > 3072);
    heap.free(p1);
    heap.free(p2);
    heap.free(p3);
    heap.free(p4);
}

// S2 - small free list is LIFO.
#[test]
fn small_free_list_is_lifo() {
    let mut heap = Heap::startup();
    let p1 = heap.alloc(24);
    let p2 = heap.alloc(24);
    heap.free(p1);
    heap.free(p2);
    let p3 = heap.alloc(24);
    let p4 = heap.alloc(24);
    assert_eq!(p3, p2);
    assert_eq!(p4, p1);
}

// S3 - large in-place shrink.
#[test]
fn large_shrink_in_place() {
    let mut heap = Heap::startup();
    let before = heap.usage();
    let p = heap.alloc(40 * 1024);
    assert_eq!(heap.block_size(p), 10 * 4096);

    let shrunk = heap.realloc(p, 20 * 1024);
    assert_eq!(shrunk, p);
    assert_eq!(heap.usage(), before + 5 * 4096);
    heap.free(shrunk);
}

// S4 - huge block realloc preserves contents whether or not the in-place
// extend succeeds (the OS is free to place the next mapping anywhere, so
// this test can't force the fallback path deterministically; it checks
// the property that must hold either way).
#[test]
fn huge_realloc_preserves_contents() {
    let mut heap = Heap::startup();
    let huge_size = 4 * 1024 * 1024; // past any large-run ceiling
    let h1 = heap.alloc(huge_size);
    unsafe {
        std::ptr::write_bytes(h1, 0xAB, huge_size);
    }

    let _h2 = heap.alloc(huge_size);

    let grown = heap.realloc(h1, huge_size * 2);
    assert!(!grown.is_null());
    unsafe {
        let tail = std::slice::from_raw_parts(grown, huge_size);
        assert!(tail.iter().all(|&b| b == 0xAB));
    }
    heap.free(grown);
}

// S5 - GC reclaims fully-empty bins.
#[test]
fn gc_reclaims_empty_bins() {
    let mut heap = Heap::startup();
    let real_before = heap.real_usage();

    let mut ptrs = Vec::with_capacity(10_000);
    for _ in 0..10_000 {
        ptrs.push(heap.alloc(24));
    }
    for p in ptrs {
        heap.free(p);
    }

    let reclaimed = heap.gc();
    assert!(reclaimed > 0);
    assert!(heap.real_usage() >= real_before);

    // Idempotent when nothing changed between calls.
    assert_eq!(heap.gc(), 0);
}

// S6 - limit enforcement. spec.md §8 sketches the expected count in prose
// ("2 MiB chunk minus header yields one 1 MiB + change, plus one extra
// chunk") rather than an exact formula, and that sketch is fragile against
// this implementation's actual chunk-header size. The real constraint,
// derived from the same chunk/page geometry the allocator itself uses, is
// two-fold and doesn't depend on exactly how big the header is: (a) a
// chunk's payload is always under 2 MiB (at least one page is reserved for
// the header), so two 1 MiB allocations can never share one chunk -- each
// chunk services exactly one; (b) the main chunk is mapped unconditionally
// at startup and already counts against the limit, so a 4 MiB limit buys
// exactly one additional chunk beyond it. That's 2 chunks, hence exactly 2
// successful allocations before the third request breaches the limit.
#[test]
fn limit_enforcement_triggers_fatal() {
    let mut heap = heap_for_fatal_tests();
    const CHUNK_SIZE: usize = 2 * 1024 * 1024;
    const LIMIT: usize = 4 * 1024 * 1024;
    heap.set_limit(LIMIT);

    let mut real_size = CHUNK_SIZE; // the main chunk, mapped before the limit is set.
    let mut expected_chunks = 1;
    while real_size + CHUNK_SIZE <= LIMIT {
        real_size += CHUNK_SIZE;
        expected_chunks += 1;
    }
    let expected = expected_chunks; // one 1 MiB large run fits per chunk.

    let mut successes = 0;
    loop {
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| heap.alloc(1024 * 1024)));
        match result {
            Ok(ptr) if !ptr.is_null() => successes += 1,
            _ => break,
        }
        if successes > expected + 4 {
            panic!("limit was never enforced");
        }
    }
    assert_eq!(successes, expected);
}

// Invariant: alloc-then-free round-trips usage back to its prior value.
#[test]
fn alloc_free_round_trip_preserves_usage() {
    let mut heap = Heap::startup();
    let before = heap.usage();
    let p = heap.alloc(128);
    assert!(heap.usage() > before);
    heap.free(p);
    assert_eq!(heap.usage(), before);
}

// Invariant: realloc to the same block_size is a no-op pointer-wise.
#[test]
fn realloc_same_size_returns_same_pointer() {
    let mut heap = Heap::startup();
    let p = heap.alloc(48);
    let size = heap.block_size(p);
    let q = heap.realloc(p, size);
    assert_eq!(p, q);
    heap.free(q);
}

#[test]
fn strdup_round_trips_bytes() {
    let mut heap = Heap::startup();
    let original = std::ffi::CString::new("slab heap").unwrap();
    let dup = heap.strdup(&original);
    unsafe {
        let dup_cstr = std::ffi::CStr::from_ptr(dup as *const i8);
        assert_eq!(dup_cstr, original.as_c_str());
    }
    heap.free(dup);
}

#[test]
fn calloc_zeroes_memory() {
    let mut heap = Heap::startup();
    let ptr = heap.calloc(16, 8);
    unsafe {
        let bytes = std::slice::from_raw_parts(ptr, 128);
        assert!(bytes.iter().all(|&b| b == 0));
    }
    heap.free(ptr);
}

// Invariant 6: the main chunk is never unmapped before full shutdown, even
// once every other allocation has been freed and a GC sweep runs over it.
#[test]
fn main_chunk_survives_gc_when_fully_drained() {
    let mut heap = Heap::startup();
    let real_before = heap.real_usage();
    assert_eq!(real_before, 2 * 1024 * 1024);

    let mut ptrs = Vec::new();
    for _ in 0..200 {
        ptrs.push(heap.alloc(24));
    }
    for p in ptrs {
        heap.free(p);
    }
    heap.gc();

    // Still have (at least) the one chunk backing the running heap state.
    assert!(heap.real_usage() >= 2 * 1024 * 1024);
    // The heap keeps working after the sweep -- proof it wasn't unmapped.
    let p = heap.alloc(24);
    assert!(!p.is_null());
    heap.free(p);
}

#[test]
fn safe_alloc_reports_overflow() {
    let mut heap = heap_for_fatal_tests();
    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        heap.safe_alloc(usize::MAX, 2, 0)
    }));
    assert!(result.is_err());
}
