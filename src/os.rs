//! OS memory mapping layer: allocate and release chunk-sized, chunk-aligned
//! regions from the operating system.
//!
//! Grounded on the teacher crate's `os.rs` (`os_mem_alloc_aligned`'s
//! over-map-then-trim alignment trick, and its `warn!`-on-failure logging
//! convention) and on the original's `zend_mm_mmap`/`zend_mm_mmap_fixed`/
//! `zend_mm_munmap`/`zend_mm_chunk_alloc_int`. Unix goes through `libc`'s
//! `mmap` family directly, as the teacher does; Windows goes through
//! `winapi`'s `VirtualAlloc`/`VirtualFree` family, gated behind
//! `cfg(windows)` rather than built unconditionally.

use crate::config::Options;
use crate::page::CHUNK_SIZE;
use log::warn;

/// Maps a new chunk-aligned, chunk-sized region from the OS. Returns
/// `None` on failure (the caller decides whether that's fatal).
pub fn chunk_alloc(opts: &Options) -> Option<*mut u8> {
    platform::map_aligned(CHUNK_SIZE, CHUNK_SIZE, opts)
}

/// Releases a chunk previously returned by [`chunk_alloc`].
pub fn chunk_free(ptr: *mut u8) {
    platform::free(ptr, CHUNK_SIZE);
}

/// Maps an arbitrarily large, `align`-aligned region -- used for huge
/// blocks, which are sized to the request rather than to a fixed chunk.
pub fn chunk_alloc_sized(size: usize, align: usize, opts: &Options) -> Option<*mut u8> {
    platform::map_aligned(size, align, opts)
}

/// Releases a region previously returned by [`chunk_alloc_sized`].
pub fn chunk_free_sized(ptr: *mut u8, size: usize) {
    platform::free(ptr, size);
}

/// Shrinks a tail-truncated chunk in place, releasing `old_size - new_size`
/// trailing bytes back to the OS. `new_size` must be a multiple of the OS
/// page size; matches `zend_mm_chunk_truncate`.
pub fn chunk_truncate(ptr: *mut u8, old_size: usize, new_size: usize) {
    if new_size >= old_size {
        return;
    }
    unsafe {
        let tail = ptr.add(new_size);
        platform::free(tail, old_size - new_size);
    }
}

/// Grows a previously truncated chunk back out to `new_size`, remapping the
/// tail region at a fixed address. Returns `false` if the tail couldn't be
/// remapped at that exact address (something else now occupies it); the
/// caller falls back to allocating a fresh chunk in that case, matching
/// `zend_mm_chunk_extend`.
pub fn chunk_extend(ptr: *mut u8, old_size: usize, new_size: usize, opts: &Options) -> bool {
    if new_size <= old_size {
        return true;
    }
    unsafe {
        let tail = ptr.add(old_size);
        platform::map_fixed(tail, new_size - old_size, opts)
    }
}

#[cfg(unix)]
mod platform {
    use super::{warn, Options};
    use std::ptr;

    pub fn map_aligned(size: usize, alignment: usize, opts: &Options) -> Option<*mut u8> {
        // Over-map by `alignment` extra bytes, then trim the unaligned head
        // and tail, mirroring the teacher's `os_mem_alloc_aligned`.
        let over_size = size + alignment;
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                over_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            warn!("slab_heap: mmap({} bytes) failed: {}", over_size, errno::errno());
            return None;
        }

        let raw_addr = raw as usize;
        let aligned_addr = (raw_addr + alignment - 1) & !(alignment - 1);
        let head_trim = aligned_addr - raw_addr;
        let tail_trim = over_size - head_trim - size;

        unsafe {
            if head_trim > 0 && libc::munmap(raw, head_trim) != 0 {
                warn!("slab_heap: munmap(head, {} bytes) failed", head_trim);
            }
            if tail_trim > 0 {
                let tail = (aligned_addr + size) as *mut libc::c_void;
                if libc::munmap(tail, tail_trim) != 0 {
                    warn!("slab_heap: munmap(tail, {} bytes) failed", tail_trim);
                }
            }
        }

        maybe_hint_large_pages(aligned_addr as *mut u8, size, opts);
        Some(aligned_addr as *mut u8)
    }

    pub fn map_fixed(addr: *mut u8, size: usize, opts: &Options) -> bool {
        let result = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if result == libc::MAP_FAILED {
            warn!("slab_heap: fixed mmap({:p}, {} bytes) failed", addr, size);
            return false;
        }
        maybe_hint_large_pages(addr, size, opts);
        true
    }

    pub fn free(addr: *mut u8, size: usize) {
        if addr.is_null() || size == 0 {
            return;
        }
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
        if rc != 0 {
            warn!("slab_heap: munmap({:p}, {} bytes) failed: {}", addr, size, errno::errno());
        }
    }

    fn maybe_hint_large_pages(addr: *mut u8, size: usize, opts: &Options) {
        if !opts.large_os_pages {
            return;
        }
        #[cfg(target_os = "linux")]
        unsafe {
            if libc::madvise(addr as *mut libc::c_void, size, libc::MADV_HUGEPAGE) != 0 {
                warn!("slab_heap: madvise(MADV_HUGEPAGE) failed");
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (addr, size);
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::{warn, Options};
    use std::ptr;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

    pub fn map_aligned(size: usize, alignment: usize, opts: &Options) -> Option<*mut u8> {
        // Windows has no mmap-style fixed-overwrite remap, so reserve a
        // throwaway over-sized region purely to find an aligned address,
        // release it, then commit the real allocation there. Racy against
        // other threads in general, but this allocator is single-threaded.
        let over_size = size + alignment;
        let probe = unsafe { VirtualAlloc(ptr::null_mut(), over_size, MEM_RESERVE, PAGE_READWRITE) };
        if probe.is_null() {
            warn!("slab_heap: VirtualAlloc(reserve, {} bytes) failed", over_size);
            return None;
        }

        let raw_addr = probe as usize;
        let aligned_addr = (raw_addr + alignment - 1) & !(alignment - 1);
        unsafe {
            VirtualFree(probe, 0, MEM_RELEASE);
        }

        let committed = unsafe {
            VirtualAlloc(aligned_addr as *mut _, size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
        };
        if committed.is_null() {
            warn!("slab_heap: VirtualAlloc(commit, {} bytes) failed", size);
            return None;
        }

        let _ = opts;
        Some(committed as *mut u8)
    }

    pub fn map_fixed(addr: *mut u8, size: usize, _opts: &Options) -> bool {
        let result = unsafe {
            VirtualAlloc(addr as *mut _, size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
        };
        if result.is_null() {
            warn!("slab_heap: fixed VirtualAlloc({:p}, {} bytes) failed", addr, size);
            return false;
        }
        true
    }

    pub fn free(addr: *mut u8, _size: usize) {
        if addr.is_null() {
            return;
        }
        let rc = unsafe { VirtualFree(addr as *mut _, 0, MEM_RELEASE) };
        if rc == 0 {
            warn!("slab_heap: VirtualFree({:p}) failed", addr);
        }
    }
}
