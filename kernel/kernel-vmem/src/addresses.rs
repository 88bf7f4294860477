//! # Virtual and Physical Memory Addresses
//!
//! Newtypes over `u32` so physical addresses, virtual addresses and frame
//! *indices* cannot be mixed up. A [`FrameIndex`] is a physical address
//! with the page offset shifted away; the allocator, the reference-count
//! table and the page entries all speak frame indices, and only the
//! mapper boundary converts back to byte addresses.

use core::fmt;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};

/// A **physical** memory address (machine bus address).
///
/// Newtype over `u32` to prevent mixing with virtual addresses.
/// No alignment guarantees by itself.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(pub u32);

/// A **virtual** memory address (process/kernel address space).
///
/// Newtype over `u32` to prevent mixing with physical addresses.
/// No alignment guarantees by itself.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(pub u32);

/// Index of a 4 KiB physical frame; frame `n` covers physical bytes
/// `[n * 4096, (n + 1) * 4096)`.
///
/// This is what page entries store in their upper 20 bits and what the
/// physical allocator hands out. It is always page-granular, so code
/// holding a `FrameIndex` never needs to re-check alignment.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameIndex(pub u32);

impl PhysAddr {
    #[must_use]
    pub const fn from_u32(addr: u32) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The frame containing this address (offset discarded).
    #[must_use]
    pub const fn frame(self) -> FrameIndex {
        FrameIndex(self.0 >> PAGE_SHIFT)
    }

    /// Byte offset within the containing frame.
    #[must_use]
    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl VirtAddr {
    #[must_use]
    pub const fn from_u32(addr: u32) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Extract the page-directory index (bits 31-22).
    #[inline]
    #[must_use]
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Extract the page-table index (bits 21-12).
    #[inline]
    #[must_use]
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) & 0x3ff) as usize
    }

    /// Byte offset within the page (bits 11-0).
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Round down to the containing page boundary.
    #[must_use]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// The address `pages` pages above this one. Wraps on overflow like
    /// the hardware would; callers validate ranges beforehand.
    #[must_use]
    pub const fn add_pages(self, pages: u32) -> Self {
        Self(self.0.wrapping_add(pages * PAGE_SIZE))
    }
}

impl FrameIndex {
    #[must_use]
    pub const fn from_u32(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// First byte address of the frame.
    #[must_use]
    pub const fn base(self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Debug for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameIndex({:#07x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
