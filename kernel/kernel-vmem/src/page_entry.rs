//! # 32-bit Page Entries

use crate::addresses::FrameIndex;
use bitfield_struct::bitfield;

/// A single 32-bit x86 paging entry in its raw bitfield form.
///
/// The same layout serves both levels: in a page **directory** the frame
/// bits name the frame holding a page table, in a page **table** they name
/// the frame backing the page itself.
///
/// ### Bit layout
///
/// | Bits   | Name / Mnemonic | Meaning |
/// |--------|-----------------|---------|
/// | 0      | `P` (present)   | Valid, hardware-visible mapping if set |
/// | 1      | `RW`            | Writable if set |
/// | 2      | `US`            | User-mode accessible if set |
/// | 3      | `PWT`           | Write-through caching |
/// | 4      | `PCD`           | Disable caching |
/// | 5      | `A`             | Accessed |
/// | 6      | `D`             | Dirty (leaf only) |
/// | 7      | `PS`            | 4 MiB page flag (directory level only) |
/// | 8      | `G`             | Global (leaf only) |
/// | 9      | OS: `DEMAND`    | Backing frame allocated on first touch |
/// | 10     | OS: `COW`       | Shared read-only; copy on first write |
/// | 11     | OS: `MMIO`      | Frame is device memory, never refcounted |
/// | 12–31  | `frame`         | Physical frame bits [31:12] |
///
/// ### OS-available bits
///
/// Hardware ignores bits 9-11, so the entry doubles as the sole record of
/// the kernel's paging protocol:
///
/// - `DEMAND` and `P` are mutually exclusive: a demand entry is invisible
///   to hardware until the first touch faults it in, at which point the
///   fault handler flips `DEMAND` off and `P` on.
/// - `COW` is only meaningful on present entries; such entries are always
///   write-protected until the first write promotes or copies them.
/// - `MMIO` marks frames outside the physical allocator's jurisdiction.
///   They are never reference-counted and never freed on unmap.
#[bitfield(u32)]
pub struct PageEntry {
    /// Present (P, bit 0). Hardware walks this entry only when set.
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Set to allow user-mode access.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4). Set for device memory.
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6) — leaf only. Set by the CPU on first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7). 4 MiB pages are not used; always clear.
    pub large_page: bool,

    /// Global (G, bit 8) — leaf only. TLB entry survives CR3 reloads.
    pub global_translation: bool,

    /// Demand-allocate-if-touched (OS bit 9). Mutually exclusive with `P`.
    pub demand: bool,

    /// Copy-on-write (OS bit 10). Present, shared, write-protected.
    pub copy_on_write: bool,

    /// Memory-mapped I/O (OS bit 11). Exempt from reference counting.
    pub mmio: bool,

    /// Physical frame bits [31:12].
    #[bits(20)]
    frame_bits: u32,
}

impl PageEntry {
    /// The frame this entry names.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> FrameIndex {
        FrameIndex(self.frame_bits())
    }

    #[inline]
    pub const fn set_frame(&mut self, frame: FrameIndex) {
        self.set_frame_bits(frame.as_u32());
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: FrameIndex) -> Self {
        self.with_frame_bits(frame.as_u32())
    }

    /// A zero (non-present, non-demand) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Whether the entry holds any mapping state at all (hardware-visible
    /// or pending demand allocation).
    #[inline]
    #[must_use]
    pub const fn is_occupied(self) -> bool {
        self.present() || self.demand()
    }

    /// Whether this entry's frame participates in reference counting:
    /// present and backed by RAM the allocator owns.
    #[inline]
    #[must_use]
    pub const fn is_counted(self) -> bool {
        self.present() && !self.mmio()
    }
}
