//! # Page Tables and Page Directories
//!
//! Both levels are 4 KiB frames holding 1024 [`PageEntry`] values. The
//! types are plain data; they are always manipulated in place inside a
//! physical frame reached through [`crate::PhysMapper`].

use crate::addresses::VirtAddr;
use crate::page_entry::PageEntry;
use kernel_info::memory::PAGE_SIZE;

/// Number of entries per paging structure.
pub const ENTRY_COUNT: usize = 1024;

/// One page table: the second walk level, mapping 4 MiB of address space.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

/// One page directory: the root walk level of an address space.
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set_entry(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    /// Entry for `va`, by its table-index bits.
    #[inline]
    #[must_use]
    pub const fn entry_for(&self, va: VirtAddr) -> PageEntry {
        self.entries[va.table_index()]
    }

    #[inline]
    pub const fn set_entry_for(&mut self, va: VirtAddr, entry: PageEntry) {
        self.entries[va.table_index()] = entry;
    }

    /// Clear every entry.
    pub fn zero(&mut self) {
        self.entries = [PageEntry::zero(); ENTRY_COUNT];
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set_entry(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    /// Entry for `va`, by its directory-index bits.
    #[inline]
    #[must_use]
    pub const fn entry_for(&self, va: VirtAddr) -> PageEntry {
        self.entries[va.directory_index()]
    }

    #[inline]
    pub const fn set_entry_for(&mut self, va: VirtAddr, entry: PageEntry) {
        self.entries[va.directory_index()] = entry;
    }

    /// Clear every entry.
    pub fn zero(&mut self) {
        self.entries = [PageEntry::zero(); ENTRY_COUNT];
    }

    /// Copy a contiguous range of directory slots from `other`. Used to
    /// stamp the shared kernel half into a fresh directory.
    pub fn copy_range_from(&mut self, other: &Self, range: core::ops::Range<usize>) {
        self.entries[range.clone()].copy_from_slice(&other.entries[range]);
    }
}

const _: () = {
    assert!(size_of::<PageTable>() == PAGE_SIZE as usize);
    assert!(size_of::<PageDirectory>() == PAGE_SIZE as usize);
    assert!(align_of::<PageTable>() == PAGE_SIZE as usize);
};
