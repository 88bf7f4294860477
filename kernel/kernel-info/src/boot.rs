//! # Boot Memory Map
//!
//! The firmware/bootloader handoff the physical frame allocator consumes.
//! Values are kept as `u64` at the boundary — firmware reports 64-bit
//! quantities even on a 32-bit machine — and clamped to the addressable
//! range by the consumer.

/// Classification of one firmware-reported physical memory region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionKind {
    /// Usable RAM.
    Available,
    /// Anything the kernel must not hand out (ROM, MMIO holes, ACPI data).
    Reserved,
}

/// One entry of the firmware memory map.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion {
    /// Physical byte address where the region starts.
    pub base: u64,
    /// Region length in bytes.
    pub length: u64,
    /// What the firmware says lives there.
    pub kind: RegionKind,
}

/// A half-open physical byte range `[start, end)`.
#[derive(Clone, Copy, Debug)]
pub struct PhysRange {
    pub start: u64,
    pub end: u64,
}

impl PhysRange {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

/// Everything the frame allocator needs to know at boot: the firmware map,
/// plus the ranges the bootloader already placed things in (which must be
/// re-reserved even when the firmware calls them available).
#[derive(Clone, Copy, Debug)]
pub struct BootMemoryMap<'a> {
    /// Firmware memory map entries.
    pub regions: &'a [MemoryRegion],
    /// The loaded kernel image (text, data, bss, boot allocations).
    pub kernel_image: PhysRange,
    /// Boot modules (initial ramdisk and friends).
    pub modules: &'a [PhysRange],
}
