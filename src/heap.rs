//! The allocator façade: [`Heap`] ties the chunk manager, small-slab bins,
//! huge-block list and GC sweep together behind the public alloc/free/
//! realloc surface.
//!
//! Grounded on the original's `zend_mm_heap` struct and the
//! `zend_mm_alloc_heap`/`zend_mm_free_heap`/`zend_mm_realloc_heap`/
//! `zend_mm_size`/`zend_mm_init`/`zend_mm_shutdown` functions, which this
//! module's `dispatch_*` methods mirror one-for-one. The embedded-heap
//! trick -- the heap's own state lives inside the first chunk it maps,
//! recovered later only through the `Heap` handle the caller holds, never
//! re-derived from a pointer -- is carried over from `zend_mm_init`'s
//! `heap = &chunk->heap_slot`.

use crate::bins::{self, NUM_BINS};
use crate::chunk::ChunkHeader;
use crate::config::Options;
use crate::error::{AbortReporter, FatalKind, FatalReporter};
use crate::huge::HugeListNode;
use crate::page::{first_page, PAGES_PER_CHUNK, PAGE_SIZE};
use std::ptr::NonNull;

/// Large-run ceiling: the biggest block servable from a single chunk's
/// payload pages. Anything past this goes to the huge-block allocator.
pub fn max_large_size() -> usize {
    (PAGES_PER_CHUNK - first_page()) * PAGE_SIZE
}

/// The heap's full internal state. Lives embedded inside the main chunk's
/// `heap_slot`, per [`crate::chunk::ChunkHeader`]'s layout.
pub struct HeapInner {
    pub size: usize,
    pub peak: usize,
    pub free_slot: [*mut bins::FreeSlot; NUM_BINS],
    pub real_size: usize,
    pub real_peak: usize,
    pub limit: usize,
    pub overflow: bool,
    pub huge_list: *mut HugeListNode,
    pub main_chunk: NonNull<ChunkHeader>,
    pub cached_chunks: *mut ChunkHeader,
    pub chunks_count: u32,
    pub peak_chunks_count: u32,
    pub cached_chunks_count: u32,
    pub avg_chunks_count: f64,
    pub options: Options,
    pub reporter: Box<dyn FatalReporter>,
}

impl HeapInner {
    /// Invokes the injected reporter, setting `overflow` first so that any
    /// allocation the reporter itself performs while building its
    /// diagnostic (which may re-enter this same limit check) doesn't
    /// recurse back into `report` a second time.
    pub fn report(&mut self, kind: FatalKind) -> ! {
        self.overflow = true;
        self.reporter.report(kind)
    }

    /// Pulls a chunk from the cache, or maps a fresh one from the OS,
    /// running the GC and retrying once if the map fails or would breach
    /// the configured limit. Returns the initialized, ring-linked chunk.
    /// Matches the `not_found`/`get_chunk` labels of `zend_mm_alloc_pages`.
    pub unsafe fn acquire_chunk(&mut self) -> Option<*mut ChunkHeader> {
        let (chunk, from_cache) = loop {
            if !self.cached_chunks.is_null() {
                self.cached_chunks_count -= 1;
                let c = self.cached_chunks;
                self.cached_chunks = (*c).next;
                break (c, true);
            }

            if self.real_size + crate::page::CHUNK_SIZE > self.limit {
                let reclaimed = crate::gc::collect(self);
                if reclaimed > 0 {
                    continue;
                }
                if !self.overflow {
                    self.report(FatalKind::LimitExceeded {
                        limit: self.limit,
                        requested: crate::page::PAGE_SIZE,
                    });
                }
                return None;
            }

            match crate::os::chunk_alloc(&self.options) {
                Some(ptr) => break (ptr as *mut ChunkHeader, false),
                None => {
                    let reclaimed = crate::gc::collect(self);
                    if reclaimed > 0 {
                        continue;
                    }
                    if !self.overflow {
                        self.report(FatalKind::OutOfMemory {
                            real_size: self.real_size,
                            requested: crate::page::CHUNK_SIZE,
                        });
                    }
                    return None;
                }
            }
        };

        // A cached chunk's bytes were never subtracted from `real_size`
        // when it was cached (the mapping stays resident); only a freshly
        // OS-mapped chunk adds to it here.
        if !from_cache {
            self.real_size += crate::page::CHUNK_SIZE;
            self.real_peak = self.real_peak.max(self.real_size);
        }
        self.chunks_count += 1;
        self.peak_chunks_count = self.peak_chunks_count.max(self.chunks_count);

        let heap_ptr = NonNull::new_unchecked(self as *mut HeapInner);
        ChunkHeader::init_secondary(chunk, heap_ptr, self.main_chunk.as_ptr());
        log::debug!("slab_heap: mapped chunk #{}", (*chunk).num);
        Some(chunk)
    }

    /// Dispatches to small/large/huge by size. Matches `zend_mm_alloc_heap`.
    pub unsafe fn dispatch_alloc(&mut self, size: usize) -> *mut u8 {
        if size <= bins::MAX_SMALL_SIZE {
            let bin_num = bins::size_to_bin(size);
            bins::alloc_small(self, bin_num).unwrap_or(std::ptr::null_mut())
        } else if size <= max_large_size() {
            self.alloc_large(size)
        } else {
            crate::huge::alloc_huge(self, size)
        }
    }

    unsafe fn alloc_large(&mut self, size: usize) -> *mut u8 {
        let pages = ((size + PAGE_SIZE - 1) / PAGE_SIZE) as u32;
        match crate::chunk::alloc_pages(self, pages) {
            Some(ptr) => {
                let new_size = self.size + pages as usize * PAGE_SIZE;
                self.size = new_size;
                self.peak = self.peak.max(new_size);
                ptr
            }
            None => std::ptr::null_mut(),
        }
    }

    /// Dispatches a free by inspecting the page-info word at `ptr`'s
    /// owning chunk, or routing to the huge list if `ptr` is itself
    /// chunk-aligned (a huge block has no chunk header of its own).
    /// Matches `zend_mm_free_heap`.
    pub unsafe fn dispatch_free(&mut self, ptr: *mut u8) {
        let page_offset = (ptr as usize) & (crate::page::CHUNK_SIZE - 1);
        if page_offset == 0 {
            if !ptr.is_null() {
                crate::huge::free_huge(self, ptr);
            }
            return;
        }

        let chunk = ChunkHeader::owning(ptr);
        let page_num = page_offset / PAGE_SIZE;
        let info = (*chunk).map[page_num];
        heap_check!(
            (*chunk).heap.as_ptr() as *const HeapInner == self as *const HeapInner,
            "pointer does not belong to this heap"
        );
        if info.is_small_run() {
            bins::free_small(self, ptr, info.bin_num() as usize);
        } else {
            let pages_count = info.run_pages();
            self.size -= pages_count as usize * PAGE_SIZE;
            crate::chunk::free_pages(self, chunk, page_num as u32, pages_count);
        }
    }

    /// Matches `zend_mm_size`.
    pub unsafe fn dispatch_size(&self, ptr: *const u8) -> usize {
        let page_offset = (ptr as usize) & (crate::page::CHUNK_SIZE - 1);
        if page_offset == 0 {
            return crate::huge::get_huge_block_size(self, ptr);
        }
        let chunk = ChunkHeader::owning(ptr);
        let page_num = page_offset / PAGE_SIZE;
        let info = (*chunk).map[page_num];
        heap_check!(
            (*chunk).heap.as_ptr() as *const HeapInner == self as *const HeapInner,
            "pointer does not belong to this heap"
        );
        if info.is_small_run() {
            bins::BIN_DATA_SIZE[info.bin_num() as usize] as usize
        } else {
            info.run_pages() as usize * PAGE_SIZE
        }
    }

    /// Matches `zend_mm_realloc_heap`: tries the small/large in-place fast
    /// paths first, then falls back to alloc-copy-free, restoring the
    /// recorded peak since the naive path's intermediate alloc can spike it
    /// above the eventual steady-state usage.
    pub unsafe fn dispatch_realloc(&mut self, ptr: *mut u8, size: usize, copy_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.dispatch_alloc(size);
        }

        let page_offset = (ptr as usize) & (crate::page::CHUNK_SIZE - 1);
        let old_size;
        if page_offset == 0 {
            if let Some(result) = crate::huge::realloc_huge(self, ptr, size, max_large_size()) {
                return result;
            }
            old_size = crate::huge::get_huge_block_size(self, ptr);
        } else {
            let chunk = ChunkHeader::owning(ptr);
            let page_num = page_offset / PAGE_SIZE;
            let info = (*chunk).map[page_num];
            heap_check!(
                (*chunk).heap.as_ptr() as *const HeapInner == self as *const HeapInner,
                "pointer does not belong to this heap"
            );
            if info.is_small_run() {
                let old_bin = info.bin_num() as usize;
                old_size = bins::BIN_DATA_SIZE[old_bin] as usize;
                if size <= bins::MAX_SMALL_SIZE && bins::size_to_bin(size) == old_bin {
                    return ptr;
                }
            } else {
                old_size = info.run_pages() as usize * PAGE_SIZE;
                if size > bins::MAX_SMALL_SIZE && size <= max_large_size() {
                    if let Some(result) = self.realloc_large_in_place(chunk, page_num, old_size, size) {
                        return result;
                    }
                }
            }
        }

        let orig_peak = self.peak;
        let orig_real_peak = self.real_peak;
        let fresh = self.dispatch_alloc(size);
        if !fresh.is_null() {
            std::ptr::copy_nonoverlapping(ptr, fresh, old_size.min(copy_size));
        }
        self.dispatch_free(ptr);
        self.peak = self.peak.max(orig_peak);
        self.real_peak = self.real_peak.max(orig_real_peak);
        fresh
    }

    unsafe fn realloc_large_in_place(
        &mut self,
        chunk: *mut ChunkHeader,
        page_num: usize,
        old_size: usize,
        size: usize,
    ) -> Option<*mut u8> {
        let new_size = ((size + PAGE_SIZE - 1) / PAGE_SIZE) * PAGE_SIZE;
        if new_size == old_size {
            return Some(ChunkHeader::page_addr(chunk, page_num));
        }
        let new_pages = new_size / PAGE_SIZE;
        let old_pages = old_size / PAGE_SIZE;
        let c = &mut *chunk;
        if new_size < old_size {
            let rest_pages = old_pages - new_pages;
            self.size -= rest_pages * PAGE_SIZE;
            c.map[page_num] = crate::page::PageInfo::lrun(new_pages as u32);
            c.free_pages += rest_pages as u32;
            crate::bitset::reset_range(&mut c.free_map, page_num + new_pages, rest_pages);
            if c.free_tail as usize == page_num + old_pages {
                c.free_tail = (page_num + new_pages) as u32;
            }
            Some(ChunkHeader::page_addr(chunk, page_num))
        } else {
            let grow_pages = new_pages - old_pages;
            if page_num + new_pages <= PAGES_PER_CHUNK
                && crate::bitset::is_free_range(&c.free_map, page_num + old_pages, grow_pages)
            {
                let added = grow_pages * PAGE_SIZE;
                self.size += added;
                self.peak = self.peak.max(self.size);
                c.free_pages -= grow_pages as u32;
                crate::bitset::set_range(&mut c.free_map, page_num + old_pages, grow_pages);
                c.map[page_num] = crate::page::PageInfo::lrun(new_pages as u32);
                if c.free_tail as usize == page_num + old_pages {
                    c.free_tail = (page_num + new_pages) as u32;
                }
                Some(ChunkHeader::page_addr(chunk, page_num))
            } else {
                None
            }
        }
    }

    /// Full teardown: unmaps every huge block and every chunk, including
    /// the main one this `HeapInner` lives inside of. The caller must not
    /// touch `self` again afterward. Matches `zend_mm_shutdown(heap, 1, _)`.
    pub unsafe fn shutdown_full(&mut self) {
        let mut node = self.huge_list;
        self.huge_list = std::ptr::null_mut();
        while !node.is_null() {
            let next = (*node).next;
            crate::os::chunk_free_sized((*node).ptr, (*node).size);
            node = next;
        }

        let main = self.main_chunk.as_ptr();
        let mut p = (*main).next;
        while p != main {
            let next = (*p).next;
            crate::os::chunk_free(p as *mut u8);
            p = next;
        }
        while !self.cached_chunks.is_null() {
            let next = (*self.cached_chunks).next;
            crate::os::chunk_free(self.cached_chunks as *mut u8);
            self.cached_chunks = next;
        }
        crate::os::chunk_free(main as *mut u8);
    }

    /// Non-full teardown: frees huge blocks and every chunk but the main
    /// one, trims the cache back toward the running average, and
    /// reinitializes the main chunk and bin free lists for reuse. Matches
    /// `zend_mm_shutdown(heap, 0, _)`.
    pub unsafe fn recycle(&mut self) {
        let mut node = self.huge_list;
        self.huge_list = std::ptr::null_mut();
        while !node.is_null() {
            let next = (*node).next;
            crate::os::chunk_free_sized((*node).ptr, (*node).size);
            self.real_size -= (*node).size;
            node = next;
        }

        // Move every chunk but the main one into the cache. Still-resident
        // mapped bytes, so `real_size` (chunks_count + cached_chunks_count
        // in aggregate) is unaffected by this transfer alone.
        let main = self.main_chunk.as_ptr();
        let mut p = (*main).next;
        while p != main {
            let next = (*p).next;
            self.chunks_count -= 1;
            self.cached_chunks_count += 1;
            (*p).next = self.cached_chunks;
            self.cached_chunks = p;
            p = next;
        }

        self.avg_chunks_count = (self.avg_chunks_count + self.peak_chunks_count as f64) / 2.0;
        while (self.cached_chunks_count as f64) + 0.9 > self.avg_chunks_count && !self.cached_chunks.is_null() {
            let c = self.cached_chunks;
            self.cached_chunks = (*c).next;
            crate::os::chunk_free(c as *mut u8);
            self.cached_chunks_count -= 1;
            self.real_size -= crate::page::CHUNK_SIZE;
        }

        let heap_ptr = NonNull::new_unchecked(self as *mut HeapInner);
        ChunkHeader::init_main(main, heap_ptr);
        self.free_slot = [std::ptr::null_mut(); NUM_BINS];
        self.chunks_count = 1;
        self.peak_chunks_count = 1;
        self.size = 0;
        self.peak = 0;
        self.real_peak = self.real_size;
    }
}

/// An explicit memory heap: a self-contained slab/page/huge-block
/// allocator with no global state, no thread-local default, and no
/// implicit synchronization (spec: single-threaded by design).
pub struct Heap {
    inner: NonNull<HeapInner>,
}

impl Heap {
    /// Maps the first chunk and brings up a heap with the default
    /// `AbortReporter` and default [`Options`]. Matches `zend_mm_startup`.
    pub fn startup() -> Heap {
        Self::startup_with(Options::default(), Box::new(AbortReporter))
    }

    /// Like [`Heap::startup`] but with an injected fatal-condition
    /// reporter, letting an embedder substitute its own bailout mechanism
    /// for the default log-and-abort behavior.
    pub fn startup_with_reporter(reporter: Box<dyn FatalReporter>) -> Heap {
        Self::startup_with(Options::default(), reporter)
    }

    fn startup_with(options: Options, reporter: Box<dyn FatalReporter>) -> Heap {
        let chunk = crate::os::chunk_alloc(&options)
            .expect("slab_heap: failed to map the initial chunk") as *mut ChunkHeader;

        unsafe {
            let heap_slot_ptr = std::ptr::addr_of_mut!((*chunk).heap_slot) as *mut HeapInner;
            let heap_ptr = NonNull::new_unchecked(heap_slot_ptr);

            std::ptr::write(
                heap_slot_ptr,
                HeapInner {
                    size: 0,
                    peak: 0,
                    free_slot: [std::ptr::null_mut(); NUM_BINS],
                    real_size: crate::page::CHUNK_SIZE,
                    real_peak: crate::page::CHUNK_SIZE,
                    limit: options.initial_limit,
                    overflow: false,
                    huge_list: std::ptr::null_mut(),
                    main_chunk: NonNull::new_unchecked(chunk),
                    cached_chunks: std::ptr::null_mut(),
                    chunks_count: 1,
                    peak_chunks_count: 1,
                    cached_chunks_count: 0,
                    avg_chunks_count: 1.0,
                    options,
                    reporter,
                },
            );

            ChunkHeader::init_main(chunk, heap_ptr);
            Heap { inner: heap_ptr }
        }
    }

    #[inline]
    fn inner(&mut self) -> &mut HeapInner {
        unsafe { self.inner.as_mut() }
    }

    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        unsafe { self.inner().dispatch_alloc(size) }
    }

    pub fn free(&mut self, ptr: *mut u8) {
        unsafe { self.inner().dispatch_free(ptr) }
    }

    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe { self.inner().dispatch_realloc(ptr, size, size) }
    }

    /// Reallocates but copies only `copy_size` bytes of the old contents
    /// forward (rather than `min(old_size, size)`), for callers that know
    /// the logical length differs from the block's allocated size. Matches
    /// `_zend_mm_realloc2`.
    pub fn realloc_keep(&mut self, ptr: *mut u8, size: usize, copy_size: usize) -> *mut u8 {
        unsafe { self.inner().dispatch_realloc(ptr, size, copy_size) }
    }

    pub fn block_size(&self, ptr: *const u8) -> usize {
        unsafe { self.inner.as_ref().dispatch_size(ptr) }
    }

    /// Checked `nmemb * size (+ offset)`, reporting [`FatalKind::IntegerOverflow`]
    /// instead of wrapping. Matches `_safe_emalloc`/`zend_safe_address_guarded`.
    pub fn safe_alloc(&mut self, nmemb: usize, size: usize, offset: usize) -> *mut u8 {
        let total = nmemb
            .checked_mul(size)
            .and_then(|v| v.checked_add(offset))
            .unwrap_or_else(|| self.inner().report(FatalKind::IntegerOverflow { nmemb, size }));
        self.alloc(total)
    }

    pub fn calloc(&mut self, nmemb: usize, size: usize) -> *mut u8 {
        let ptr = self.safe_alloc(nmemb, size, 0);
        if !ptr.is_null() {
            unsafe { std::ptr::write_bytes(ptr, 0, nmemb * size) };
        }
        ptr
    }

    /// Duplicates a NUL-terminated byte string, matching `_estrdup`.
    pub fn strdup(&mut self, s: &std::ffi::CStr) -> *mut u8 {
        let bytes = s.to_bytes_with_nul();
        let ptr = self.alloc(bytes.len());
        if !ptr.is_null() {
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        }
        ptr
    }

    /// Duplicates `length` bytes of `s` and appends a NUL, matching
    /// `_estrndup`.
    pub fn strndup(&mut self, s: &[u8], length: usize) -> *mut u8 {
        let ptr = self.alloc(length + 1);
        if !ptr.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(s.as_ptr(), ptr, length);
                *ptr.add(length) = 0;
            }
        }
        ptr
    }

    pub fn gc(&mut self) -> usize {
        unsafe { crate::gc::collect(self.inner()) }
    }

    pub fn set_limit(&mut self, bytes: usize) {
        self.inner().limit = bytes.max(crate::page::CHUNK_SIZE);
    }

    pub fn usage(&self) -> usize {
        unsafe { self.inner.as_ref().size }
    }

    pub fn real_usage(&self) -> usize {
        unsafe { self.inner.as_ref().real_size }
    }

    pub fn peak_usage(&self) -> usize {
        unsafe { self.inner.as_ref().peak }
    }

    pub fn real_peak_usage(&self) -> usize {
        unsafe { self.inner.as_ref().real_peak }
    }

    /// Allocates directly from a known bin, skipping the size-to-bin
    /// lookup. Matches the `_emalloc_<size>` specialized entry points
    /// generated per bin by the original's macros.
    pub fn alloc_bin(&mut self, bin_num: usize) -> *mut u8 {
        unsafe { bins::alloc_small(self.inner(), bin_num).unwrap_or(std::ptr::null_mut()) }
    }

    /// Frees directly to a known bin, skipping the page-map lookup.
    /// Matches the `_efree_<size>` specialized entry points.
    pub fn free_bin(&mut self, ptr: *mut u8, bin_num: usize) {
        unsafe { bins::free_small(self.inner(), ptr, bin_num) }
    }

    /// Releases every chunk but the main one and reinitializes it for
    /// reuse, instead of unmapping everything. Useful for a runtime that
    /// tears down a request's allocations but wants to keep the heap
    /// warm for the next one. Matches `zend_mm_shutdown(heap, 0, _)`.
    pub fn recycle(&mut self) {
        unsafe { self.inner().recycle() }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe {
            self.inner.as_mut().shutdown_full();
        }
    }
}
