//! # Memory Layout

/// Size of one page / physical frame in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// Log2 of [`PAGE_SIZE`]; shift between byte addresses and frame indices.
pub const PAGE_SHIFT: u32 = 12;

/// Number of physical frames in the full 32-bit physical address space.
///
/// The frame bitmap spans the entire space so firmware-reported holes need
/// no special casing; absent RAM simply stays marked reserved.
pub const TOTAL_FRAMES: usize = 1 << 20;

/// Base of the user dynamic-mapping area. Address-space searches for
/// "map anywhere" requests start here.
pub const USER_DYNAMIC_BASE: u32 = 0x4000_0000;

/// First address of the kernel half. Everything below is private to the
/// owning process; everything at or above is shared by all address spaces.
pub const KERNEL_SPACE_BASE: u32 = 0x8000_0000;

/// Base of the kernel heap's virtual window.
pub const KERNEL_HEAP_BASE: u32 = 0x8000_0000;

/// Number of page slots in the kernel heap window (256 MiB).
pub const KERNEL_HEAP_PAGES: usize = 65536;

/// One past the last kernel-heap address.
pub const KERNEL_HEAP_END: u32 = KERNEL_HEAP_BASE + (KERNEL_HEAP_PAGES as u32) * PAGE_SIZE;

/// Where the kernel image (text and data) lives.
pub const KERNEL_IMAGE_BASE: u32 = 0xC000_0000;

/// Number of page-directory entries covering the private (user) half.
pub const USER_PAGE_TABLES: usize = 512;

/// Number of page-directory entries covering the shared kernel half.
pub const KERNEL_PAGE_TABLES: usize = 512;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(KERNEL_HEAP_BASE == KERNEL_SPACE_BASE);
    assert!(KERNEL_HEAP_END <= KERNEL_IMAGE_BASE);
    assert!(USER_DYNAMIC_BASE < KERNEL_SPACE_BASE);
    // each directory entry spans 4 MiB; 512 of them cover exactly 2 GiB
    assert!((USER_PAGE_TABLES as u32) * 1024 * PAGE_SIZE == KERNEL_SPACE_BASE);
    assert!(USER_PAGE_TABLES + KERNEL_PAGE_TABLES == 1024);
};
