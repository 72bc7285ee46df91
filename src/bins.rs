//! Small-slab size classes and the free-list allocator built on top of
//! large runs.
//!
//! Grounded on the original's `bin_data_size`/`bin_elements`/`bin_pages`
//! tables (`ZEND_MM_BINS_INFO`, reconstructed numerically here since the
//! retrieved source tree filters out the `zend_alloc_sizes.h` header that
//! defines them) and `zend_mm_small_size_to_bin`'s exact bit-trick, plus
//! `zend_mm_alloc_small_slow`/`zend_mm_alloc_small`/`zend_mm_free_small`.

use crate::chunk::{self, ChunkHeader};
use crate::heap::HeapInner;
use crate::page::PageInfo;

pub const NUM_BINS: usize = 30;

/// Data size, in bytes, addressable from each bin.
pub const BIN_DATA_SIZE: [u32; NUM_BINS] = [
    8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640,
    768, 896, 1024, 1280, 1536, 1792, 2048, 2560, 3072,
];

/// Element (slot) count per bin run.
pub const BIN_ELEMENTS: [u32; NUM_BINS] = [
    512, 256, 170, 128, 102, 85, 73, 64, 51, 42, 36, 32, 25, 21, 18, 16, 12, 10, 9, 8, 6, 5, 4, 4,
    3, 2, 2, 2, 3, 5,
];

/// Pages consumed per bin run.
pub const BIN_PAGES: [u32; NUM_BINS] = [
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 4,
];

/// Largest size servable by the small-slab allocator; anything above this
/// goes to the large-run (page) allocator.
pub const MAX_SMALL_SIZE: usize = BIN_DATA_SIZE[NUM_BINS - 1] as usize;

/// Maps a requested size to its bin index. Matches
/// `zend_mm_small_size_to_bin`'s bit-trick exactly: sizes up to 64 round up
/// in 8-byte steps (bin = `(size - 1) >> 3`), above that the bin is derived
/// from the position of the highest set bit of `size - 1`.
pub fn size_to_bin(size: usize) -> usize {
    if size <= 64 {
        if size == 0 {
            0
        } else {
            (size - 1) >> 3
        }
    } else {
        let t1 = (size - 1) as u32;
        let bit = 32 - t1.leading_zeros();
        let shift = bit - 3;
        let scaled = t1 >> shift;
        (scaled + ((shift - 3) << 2)) as usize
    }
}

/// A free slot: an intrusive singly-linked list node occupying the data
/// area of one element of a small-slab run.
#[repr(C)]
pub struct FreeSlot {
    pub next: *mut FreeSlot,
}

/// Carves a fresh run of `bin_num`'s pages from the large-run allocator,
/// threads its elements but the first into the bin's free list, and returns
/// the first element as the new allocation. Matches
/// `zend_mm_alloc_small_slow`.
unsafe fn alloc_small_slow(heap: &mut HeapInner, bin_num: usize) -> Option<*mut u8> {
    let pages = BIN_PAGES[bin_num];
    let bin = chunk::alloc_pages(heap, pages)?;

    let owner = ChunkHeader::owning(bin);
    let page_offset = (bin as usize) - (owner as usize);
    let page_num = page_offset / crate::page::PAGE_SIZE;
    (*owner).map[page_num] = PageInfo::srun(bin_num as u32);
    for i in 1..pages as usize {
        (*owner).map[page_num + i] = PageInfo::nrun(i as u32);
    }

    let data_size = BIN_DATA_SIZE[bin_num] as usize;
    let elements = BIN_ELEMENTS[bin_num] as usize;
    let mut p = bin.add(data_size) as *mut FreeSlot;
    heap.free_slot[bin_num] = p;
    for _ in 1..elements - 1 {
        let next = (p as *mut u8).add(data_size) as *mut FreeSlot;
        (*p).next = next;
        p = next;
    }
    (*p).next = std::ptr::null_mut();

    log::trace!("slab_heap: carved new bin {} run ({} elements)", bin_num, elements);
    Some(bin)
}

/// Allocates one element from `bin_num`, popping the free list if it has
/// slots or carving a fresh run otherwise. Matches `zend_mm_alloc_small`.
pub unsafe fn alloc_small(heap: &mut HeapInner, bin_num: usize) -> Option<*mut u8> {
    let size = heap.size + BIN_DATA_SIZE[bin_num] as usize;
    heap.size = size;
    heap.peak = heap.peak.max(size);

    let head = heap.free_slot[bin_num];
    if !head.is_null() {
        heap.free_slot[bin_num] = (*head).next;
        return Some(head as *mut u8);
    }
    alloc_small_slow(heap, bin_num)
}

/// Returns an element to `bin_num`'s free list. Matches
/// `zend_mm_free_small`.
pub unsafe fn free_small(heap: &mut HeapInner, ptr: *mut u8, bin_num: usize) {
    heap.size -= BIN_DATA_SIZE[bin_num] as usize;
    let slot = ptr as *mut FreeSlot;
    (*slot).next = heap.free_slot[bin_num];
    heap.free_slot[bin_num] = slot;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bins_are_self_consistent() {
        for i in 0..NUM_BINS {
            assert!(
                BIN_ELEMENTS[i] as u64 * BIN_DATA_SIZE[i] as u64
                    <= BIN_PAGES[i] as u64 * crate::page::PAGE_SIZE as u64
            );
        }
    }

    #[test]
    fn size_to_bin_matches_table_at_class_boundaries() {
        for (bin, &size) in BIN_DATA_SIZE.iter().enumerate() {
            assert_eq!(size_to_bin(size as usize), bin, "size {}", size);
        }
    }

    #[test]
    fn size_to_bin_rounds_up() {
        assert_eq!(size_to_bin(1), 0);
        assert_eq!(size_to_bin(9), 1);
        assert_eq!(size_to_bin(65), 8);
        assert_eq!(size_to_bin(2561), 29);
    }
}
