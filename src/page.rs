//! Chunk/page geometry constants and the packed page-info word.
//!
//! Grounded on the original's `ZEND_MM_CHUNK_SIZE`/`ZEND_MM_PAGE_SIZE`
//! constants and the `ZEND_MM_IS_FRUN`/`ZEND_MM_IS_LRUN`/`ZEND_MM_IS_SRUN`/
//! `ZEND_MM_IS_NRUN` macro family that packs run-kind, length and bin number
//! into a single `u32` per page.

use crate::chunk::ChunkHeader;

/// Size of a single page within a chunk.
pub const PAGE_SIZE: usize = 4096;

/// Size of a chunk: 2 MiB, matching the original's `ZEND_MM_CHUNK_SIZE`.
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Alignment chunks are mapped at (chunks are self-aligning: masking any
/// payload pointer with `!(CHUNK_SIZE - 1)` recovers the owning chunk).
pub const CHUNK_ALIGN: usize = CHUNK_SIZE;

/// Number of pages in a chunk.
pub const PAGES_PER_CHUNK: usize = CHUNK_SIZE / PAGE_SIZE;

/// Number of `usize` words needed to represent one bit per page.
pub const BITSET_WORDS: usize = (PAGES_PER_CHUNK + crate::bitset::BITS_PER_WORD - 1)
    / crate::bitset::BITS_PER_WORD;

/// Index of the first page available for allocation: the chunk header
/// (which embeds the heap slot on the main chunk) occupies whole pages
/// starting at page 0, so payload pages start once the header's size is
/// rounded up to a page boundary.
pub fn first_page() -> usize {
    (core::mem::size_of::<ChunkHeader>() + PAGE_SIZE - 1) / PAGE_SIZE
}

const SRUN_BIT: u32 = 0x8000_0000;
const LRUN_BIT: u32 = 0x4000_0000;
const NRUN_BIT: u32 = SRUN_BIT | LRUN_BIT;

/// Packed per-page state: free (`FRUN`), the head of a large run (`LRUN`,
/// carrying its page length), the head of a small-bin run (`SRUN`, carrying
/// the bin number and a live free-slot counter used only during GC), or a
/// continuation page of either (`NRUN`, carrying an offset back to its run's
/// head page).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo(pub u32);

impl PageInfo {
    pub const FREE: PageInfo = PageInfo(0);

    #[inline]
    pub fn lrun(pages: u32) -> PageInfo {
        PageInfo(LRUN_BIT | pages)
    }

    #[inline]
    pub fn srun(bin_num: u32) -> PageInfo {
        PageInfo(SRUN_BIT | bin_num)
    }

    #[inline]
    pub fn srun_with_free(bin_num: u32, free_counter: u32) -> PageInfo {
        PageInfo(SRUN_BIT | bin_num | (free_counter << 16))
    }

    #[inline]
    pub fn nrun(offset_from_head: u32) -> PageInfo {
        PageInfo(NRUN_BIT | offset_from_head)
    }

    #[inline]
    pub fn is_free(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_large_run(self) -> bool {
        self.0 & NRUN_BIT == LRUN_BIT
    }

    #[inline]
    pub fn is_small_run(self) -> bool {
        self.0 & NRUN_BIT == SRUN_BIT
    }

    #[inline]
    pub fn is_run_continuation(self) -> bool {
        self.0 & NRUN_BIT == NRUN_BIT
    }

    /// Page count of an `LRUN` head. Only valid when [`Self::is_large_run`].
    #[inline]
    pub fn run_pages(self) -> u32 {
        self.0 & !LRUN_BIT
    }

    /// Bin number of an `SRUN` head. Only valid when [`Self::is_small_run`].
    #[inline]
    pub fn bin_num(self) -> u32 {
        self.0 & 0xffff
    }

    /// Live free-slot counter of an `SRUN` head, used only while the GC
    /// sweep accounts bins in its first pass.
    #[inline]
    pub fn free_counter(self) -> u32 {
        (self.0 >> 16) & 0x3fff
    }

    #[inline]
    pub fn with_free_counter(self, counter: u32) -> PageInfo {
        PageInfo((self.0 & !(0x3fff << 16)) | (counter << 16))
    }

    /// Offset back to an `NRUN` continuation's run head, in pages.
    #[inline]
    pub fn run_offset(self) -> u32 {
        self.0 & !NRUN_BIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_is_zero() {
        assert!(PageInfo::FREE.is_free());
        assert!(!PageInfo::FREE.is_large_run());
        assert!(!PageInfo::FREE.is_small_run());
    }

    #[test]
    fn lrun_round_trips_page_count() {
        let info = PageInfo::lrun(17);
        assert!(info.is_large_run());
        assert_eq!(info.run_pages(), 17);
    }

    #[test]
    fn srun_round_trips_bin_and_counter() {
        let info = PageInfo::srun(5).with_free_counter(12);
        assert!(info.is_small_run());
        assert_eq!(info.bin_num(), 5);
        assert_eq!(info.free_counter(), 12);
    }

    #[test]
    fn nrun_round_trips_offset() {
        let info = PageInfo::nrun(9);
        assert!(info.is_run_continuation());
        assert_eq!(info.run_offset(), 9);
    }

    #[test]
    fn chunk_pages_fit_bitset_words() {
        assert_eq!(PAGES_PER_CHUNK, 512);
        assert!(BITSET_WORDS * crate::bitset::BITS_PER_WORD >= PAGES_PER_CHUNK);
    }
}
