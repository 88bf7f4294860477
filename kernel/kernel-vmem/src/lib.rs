//! # 32-bit Virtual Memory Structures
//!
//! Plain-data descriptions of the x86 protected-mode two-level paging
//! structures, plus the small traits the memory manager uses to reach
//! physical memory:
//!
//! - Address newtypes ([`PhysAddr`], [`VirtAddr`], [`FrameIndex`]).
//! - The 32-bit page entry bitfield ([`PageEntry`]), shared by directory
//!   and table levels.
//! - 4 KiB-aligned [`PageTable`] / [`PageDirectory`] frames.
//! - The [`PhysMapper`] seam that turns a physical address into a usable
//!   reference, so the same walking code runs under a real direct map and
//!   under a test arena.
//!
//! ## x86 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22     | 21‒12  | 11‒0   |
//! | Directory | Table  | Offset |
//! ```
//!
//! The CPU uses the first two fields as **indices** into two levels of
//! page tables, each level containing 1024 (2¹⁰) entries of 4 bytes each.
//! A directory entry names the frame holding a page table; a table entry
//! names the frame backing the page itself.
//!
//! Nothing in this crate allocates or takes locks; policy lives in
//! `kernel-alloc`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod addresses;
pub mod page_entry;
pub mod page_table;
pub mod tlb;

pub use addresses::{FrameIndex, PhysAddr, VirtAddr};
pub use page_entry::PageEntry;
pub use page_table::{PageDirectory, PageTable};
pub use tlb::{flush_all_tlb, invalidate_tlb_page};

/// Converts physical addresses to *temporarily* usable pointers in the
/// current virtual address space.
///
/// The kernel proper backs this with its direct map of physical memory;
/// host tests back it with an in-memory frame arena. Everything that walks
/// or edits page tables is generic over this trait so the walking code is
/// identical in both worlds.
///
/// # Safety
///
/// Implementations must only be used for physical ranges that are actually
/// mapped and valid for the requested `T`.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable pointer in the
    /// current address space.
    ///
    /// # Safety
    ///
    /// `pa` must be mapped, aligned for `T`, and the backing bytes must be
    /// a valid `T`. The returned borrow is unchecked; callers must not
    /// create aliasing mutable references to the same frame.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T;
}

/// Map a physical page-table frame and return a mutable reference to it.
///
/// # Safety
///
/// `phys` must be a 4 KiB-aligned frame holding a page table. See
/// [`PhysMapper::phys_to_mut`] for the aliasing rules.
#[inline]
#[must_use]
pub unsafe fn get_table<'a, M: PhysMapper>(m: &M, phys: PhysAddr) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(phys) }
}

/// Map a physical page-directory frame and return a mutable reference to it.
///
/// # Safety
///
/// `phys` must be a 4 KiB-aligned frame holding a page directory. See
/// [`PhysMapper::phys_to_mut`] for the aliasing rules.
#[inline]
#[must_use]
pub unsafe fn get_directory<'a, M: PhysMapper>(m: &M, phys: PhysAddr) -> &'a mut PageDirectory {
    unsafe { m.phys_to_mut::<PageDirectory>(phys) }
}
