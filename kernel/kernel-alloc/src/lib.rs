//! # Kernel Memory Manager
//!
//! The virtual-memory core of a 32-bit, single-address-space-per-process
//! kernel: physical frame accounting, frame share counts, the kernel
//! heap, per-process user address spaces, and the page-fault handler
//! that implements demand paging and copy-on-write on top of them.
//!
//! Everything hangs off one explicit [`MemoryManager`] context object,
//! constructed once at boot from the firmware memory map and passed by
//! reference — there are no free-floating statics. Physical memory is
//! only ever named by [`FrameIndex`] and only ever *touched* through the
//! [`PhysMapper`] seam, which is what lets the whole subsystem run its
//! tests on a host against an in-memory frame arena.
//!
//! ## Ownership of a frame
//!
//! Every allocated frame has exactly one owner class:
//!
//! - **Kernel heap** frames back heap pages, page tables, page
//!   directories and refcount blocks. They are never reference-counted;
//!   the heap frees them directly.
//! - **User** frames back user mappings and are governed by the
//!   reference-count table: the bitmap bit is cleared only when the last
//!   present, non-MMIO page entry naming the frame goes away.
//! - **MMIO** "frames" are device memory outside the allocator's
//!   jurisdiction entirely.
//!
//! The invariant the whole design leans on: a user frame's reference
//! count always equals the number of present, non-MMIO page entries
//! naming it, across all address spaces.
//!
//! ## Errors
//!
//! Two sharply separated families. Resource exhaustion ([`AllocError`],
//! [`address_space::MapError`]) is ordinary and recoverable: it comes
//! back as `Err` and multi-page operations roll back before returning.
//! Protocol violations by kernel code — double unreference, destroying
//! the active address space, freeing outside the heap window — are bugs,
//! not conditions, and panic. Invalid faults surface as
//! [`fault::FaultError`] to the trap layer, which halts.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
pub mod fault;
pub mod frame_alloc;
pub mod heap;
pub mod refcount;

pub use address_space::{AddressSpace, ClobberPolicy, MapError, MapPlacement};
pub use fault::{FaultError, FaultResolution, PageFaultCode, Registers};
pub use frame_alloc::FrameBitmap;
pub use heap::{HeapAllocation, HeapBacking, HeapPage, HeapStats, KernelHeap};
pub use refcount::RefCountTable;

use kernel_info::boot::BootMemoryMap;
use kernel_info::memory::PAGE_SIZE;
use kernel_sync::IrqGuard;
use kernel_vmem::{FrameIndex, PhysAddr, PhysMapper, VirtAddr};

/// Recoverable resource exhaustion. Never a bug; callers decide whether
/// to degrade, retry smaller, or surface "insufficient memory".
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("kernel heap window exhausted")]
    HeapExhausted,
    #[error("no contiguous run of {0} free kernel heap pages")]
    NoContiguousRun(usize),
}

/// Who will own a freshly requested frame; decides whether the frame is
/// reference-counted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameOwner {
    /// Heap-owned: freed directly, never counted.
    KernelHeap,
    /// User mapping: governed by the reference-count table.
    UserSpace,
}

/// The memory-management context. One instance per machine, built at
/// boot; every component below is reached through it.
pub struct MemoryManager<'m, M: PhysMapper> {
    mapper: &'m M,
    frames: FrameBitmap,
    refcounts: RefCountTable,
    heap: KernelHeap,
    /// Directory frame whose upper half maps the kernel; stamped into
    /// every new address space. Supplied by boot code, which also keeps
    /// the frame reserved in the boot memory map.
    kernel_template: FrameIndex,
    /// Directory frame currently loaded in CR3, if a user space is
    /// active. A borrow of the owning process's space, never ownership.
    active: Option<FrameIndex>,
    fault_count: u64,
}

impl<'m, M: PhysMapper> MemoryManager<'m, M> {
    /// Build the manager from the firmware memory map.
    ///
    /// `kernel_template` is the boot-prepared page directory whose upper
    /// half (kernel image, heap window tables, direct map) every address
    /// space shares; its frame must be covered by the map's reserved
    /// ranges.
    #[must_use]
    pub fn new(mapper: &'m M, boot: &BootMemoryMap<'_>, kernel_template: FrameIndex) -> Self {
        let frames = FrameBitmap::from_boot_map(boot);
        log::info!(
            "memory manager up: {} free frames, heap window {} pages",
            frames.free_frames(),
            kernel_info::memory::KERNEL_HEAP_PAGES
        );
        Self {
            mapper,
            frames,
            refcounts: RefCountTable::new(),
            heap: KernelHeap::new(),
            kernel_template,
            active: None,
            fault_count: 0,
        }
    }

    /// Allocate one physical frame for `owner`. User frames enter the
    /// reference-count table with a count of 1.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfFrames`] when no frame is free, or block
    /// allocation failure from the reference-count table.
    pub fn request_frame(&mut self, owner: FrameOwner) -> Result<FrameIndex, AllocError> {
        let _irq = IrqGuard::new();
        let frame = self.frames.find_free_frame().ok_or(AllocError::OutOfFrames)?;
        self.frames.set_frame(frame);
        if owner == FrameOwner::UserSpace {
            if let Err(e) =
                self.refcounts
                    .reference(frame, &mut self.heap, &mut self.frames, self.mapper)
            {
                self.frames.clear_frame(frame);
                return Err(e);
            }
        }
        Ok(frame)
    }

    /// Give a frame back. Kernel-heap frames are freed directly; user
    /// frames are unreferenced and freed only when their count reaches
    /// zero.
    pub fn release_frame(&mut self, frame: FrameIndex, owner: FrameOwner) {
        let _irq = IrqGuard::new();
        match owner {
            FrameOwner::KernelHeap => self.frames.clear_frame(frame),
            FrameOwner::UserSpace => self.drop_user_frame(frame),
        }
    }

    /// Unreference a user frame, clearing its bitmap bit at count zero.
    pub(crate) fn drop_user_frame(&mut self, frame: FrameIndex) {
        let remaining =
            self.refcounts
                .unreference(frame, &mut self.heap, &mut self.frames, self.mapper);
        if remaining == 0 {
            self.frames.clear_frame(frame);
        }
    }

    /// Allocate `size` bytes from the kernel heap. See
    /// [`KernelHeap::allocate`].
    ///
    /// # Errors
    ///
    /// See [`KernelHeap::allocate`].
    pub fn heap_allocate(
        &mut self,
        size: usize,
        backing: HeapBacking,
    ) -> Result<HeapAllocation, AllocError> {
        let _irq = IrqGuard::new();
        self.heap
            .allocate(size, backing, &mut self.frames, self.mapper)
    }

    /// Resize a kernel-heap allocation to `new_size` bytes. See
    /// [`KernelHeap::reallocate`].
    ///
    /// # Errors
    ///
    /// See [`KernelHeap::reallocate`].
    pub fn heap_reallocate(
        &mut self,
        virt: VirtAddr,
        new_size: usize,
    ) -> Result<VirtAddr, AllocError> {
        let _irq = IrqGuard::new();
        self.heap
            .reallocate(virt, new_size, &mut self.frames, self.mapper)
    }

    /// Free a kernel-heap allocation. See [`KernelHeap::free`].
    pub fn heap_free(&mut self, virt: VirtAddr) {
        let _irq = IrqGuard::new();
        self.heap.free(virt, &mut self.frames);
    }

    /// Map device memory into the heap window. See
    /// [`KernelHeap::map_physical`].
    ///
    /// # Errors
    ///
    /// See [`KernelHeap::map_physical`].
    pub fn heap_map_physical(
        &mut self,
        base: PhysAddr,
        pages: usize,
        read_write: bool,
    ) -> Result<VirtAddr, AllocError> {
        let _irq = IrqGuard::new();
        self.heap.map_physical(base, pages, read_write)
    }

    /// Read-only heap introspection (stats, run-length bookkeeping).
    #[must_use]
    pub const fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.frames.total_frames()
    }

    /// Distinct user frames currently reference-counted.
    #[must_use]
    pub const fn referenced_frames(&self) -> usize {
        self.refcounts.referenced_frames()
    }

    /// Current share count of a user frame.
    #[must_use]
    pub fn frame_ref_count(&self, frame: FrameIndex) -> u32 {
        self.refcounts.count(frame, self.mapper)
    }

    /// Page faults handled since boot.
    #[must_use]
    pub const fn page_fault_count(&self) -> u64 {
        self.fault_count
    }

    /// Directory frame currently active, if a user space is loaded.
    #[must_use]
    pub const fn active_directory(&self) -> Option<FrameIndex> {
        self.active
    }

    pub(crate) const fn set_active(&mut self, active: Option<FrameIndex>) {
        self.active = active;
    }

    pub(crate) const fn kernel_template_frame(&self) -> FrameIndex {
        self.kernel_template
    }

    pub(crate) const fn count_fault(&mut self) {
        self.fault_count += 1;
    }

    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }
}

pub(crate) const PAGE_BYTES: usize = PAGE_SIZE as usize;

/// Zero-fill a frame through the mapper.
pub(crate) fn zero_frame<M: PhysMapper>(mapper: &M, frame: FrameIndex) {
    let bytes: &mut [u8; PAGE_BYTES] = unsafe { mapper.phys_to_mut(frame.base()) };
    bytes.fill(0);
}

/// Copy one frame's contents into another.
pub(crate) fn copy_frame<M: PhysMapper>(mapper: &M, from: FrameIndex, to: FrameIndex) {
    debug_assert_ne!(from, to);
    let src: &mut [u8; PAGE_BYTES] = unsafe { mapper.phys_to_mut(from.base()) };
    let dst: &mut [u8; PAGE_BYTES] = unsafe { mapper.phys_to_mut(to.base()) };
    dst.copy_from_slice(src);
}
