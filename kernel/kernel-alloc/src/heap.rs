//! # Kernel Heap
//!
//! Page-granular allocator for the kernel's 256 MiB virtual window at
//! [`KERNEL_HEAP_BASE`]. The heap is a flat array of page entries — one
//! per virtual page slot — plus a parallel run-length array recording,
//! at an allocation's first slot, how many *subsequent* pages belong to
//! the same allocation (freeing must release the whole run).
//!
//! The entry array is the backing store of the kernel-half page tables:
//! boot code points the shared upper-half directory template's heap
//! slots at these entries' physical frames, so writing an entry here is
//! what the MMU sees. On hosted builds the array is just an array, and
//! the [`PhysMapper`] supplies the "physical" frames.
//!
//! Kernel-heap frames are exclusively owned by the heap and are *never*
//! reference-counted; this is what lets the reference-count table keep
//! its own level-1 blocks in heap pages without recursing.
//!
//! A rotating cursor spreads allocations across the window. It is an
//! optimization only; correctness never depends on where a search starts.

use crate::frame_alloc::FrameBitmap;
use crate::{AllocError, copy_frame, zero_frame};
use kernel_info::memory::{KERNEL_HEAP_BASE, KERNEL_HEAP_END, KERNEL_HEAP_PAGES, PAGE_SHIFT, PAGE_SIZE};
use kernel_vmem::{FrameIndex, PageEntry, PhysAddr, PhysMapper, VirtAddr, invalidate_tlb_page};

/// How a fresh heap allocation is backed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeapBacking {
    /// No frame yet; the entry is marked demand-allocate and the first
    /// touch faults the frame in.
    Demand,
    /// A zeroed frame is attached immediately.
    Committed,
}

/// A successful heap allocation.
#[derive(Clone, Copy, Debug)]
pub struct HeapAllocation {
    pub virt: VirtAddr,
    /// Physical address of the first page. Only populated for committed
    /// allocations; only *contiguous* for single-page ones.
    pub phys: Option<PhysAddr>,
}

/// A single committed heap page together with its backing frame. The
/// currency for page directories, page tables and refcount blocks.
#[derive(Clone, Copy, Debug)]
pub struct HeapPage {
    pub virt: VirtAddr,
    pub frame: FrameIndex,
}

/// Point-in-time heap usage counters.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeapStats {
    /// RAM-backed present slots; heap-owned frames. MMIO does not count.
    pub resident_pages: usize,
    /// Occupied slots of any kind (present, demand, MMIO).
    pub used_slots: usize,
    pub free_slots: usize,
}

pub struct KernelHeap {
    /// One page entry per virtual page slot of the heap window.
    entries: [PageEntry; KERNEL_HEAP_PAGES],
    /// `run_tails[s]` = pages belonging to the allocation at slot `s`
    /// *beyond* the first. Only meaningful at an allocation's first slot.
    run_tails: [u32; KERNEL_HEAP_PAGES],
    cursor: usize,
    resident: usize,
    used: usize,
}

impl KernelHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::zero(); KERNEL_HEAP_PAGES],
            run_tails: [0; KERNEL_HEAP_PAGES],
            cursor: 0,
            resident: 0,
            used: 0,
        }
    }

    /// Allocate `size` bytes, rounded up to whole virtually contiguous
    /// heap pages.
    ///
    /// Requests within one page take the first free slot from the
    /// cursor; larger requests need a contiguous free run. Multi-page
    /// allocation is all-or-nothing: a frame failure mid-run rolls back
    /// every page already committed.
    ///
    /// # Errors
    ///
    /// [`AllocError::HeapExhausted`] / [`AllocError::NoContiguousRun`]
    /// when no suitable slot run exists, [`AllocError::OutOfFrames`] when
    /// committed backing cannot be satisfied.
    pub fn allocate<M: PhysMapper>(
        &mut self,
        size: usize,
        backing: HeapBacking,
        frames: &mut FrameBitmap,
        mapper: &M,
    ) -> Result<HeapAllocation, AllocError> {
        assert!(size > 0, "zero-byte kernel heap allocation");
        let pages = size.div_ceil(PAGE_SIZE as usize);
        let start = self.find_run(pages).ok_or(if pages == 1 {
            AllocError::HeapExhausted
        } else {
            AllocError::NoContiguousRun(pages)
        })?;

        let mut phys = None;
        for k in 0..pages {
            match backing {
                HeapBacking::Committed => match self.commit_slot(start + k, frames, mapper) {
                    Ok(frame) => {
                        if k == 0 {
                            phys = Some(frame.base());
                        }
                    }
                    Err(e) => {
                        for j in (0..k).rev() {
                            self.release_slot(start + j, frames);
                        }
                        log::debug!("kernel heap: rolled back {pages}-page allocation ({e})");
                        return Err(e);
                    }
                },
                HeapBacking::Demand => self.demand_slot(start + k),
            }
        }

        self.run_tails[start] = (pages - 1) as u32;
        self.cursor = (start + pages) % KERNEL_HEAP_PAGES;
        Ok(HeapAllocation {
            virt: Self::va_of(start),
            phys,
        })
    }

    /// Allocate one committed, zeroed page and hand back both addresses.
    ///
    /// # Errors
    ///
    /// See [`Self::allocate`].
    pub fn allocate_page<M: PhysMapper>(
        &mut self,
        frames: &mut FrameBitmap,
        mapper: &M,
    ) -> Result<HeapPage, AllocError> {
        let start = self.find_run(1).ok_or(AllocError::HeapExhausted)?;
        let frame = self.commit_slot(start, frames, mapper)?;
        self.cursor = (start + 1) % KERNEL_HEAP_PAGES;
        Ok(HeapPage {
            virt: Self::va_of(start),
            frame,
        })
    }

    /// Resize the allocation at `virt` to `new_size` bytes (rounded up
    /// to whole pages).
    ///
    /// Shrinking frees the trailing pages in place. Growing extends in
    /// place with demand-backed slots when the following slots are free;
    /// otherwise the allocation moves: present pages are copied
    /// frame-to-frame, untouched demand pages stay demand, and the old
    /// run is freed. The move is all-or-nothing.
    ///
    /// # Errors
    ///
    /// See [`Self::allocate`].
    ///
    /// # Panics
    ///
    /// If `virt` does not point at a live heap allocation, or the
    /// allocation maps physical device memory.
    pub fn reallocate<M: PhysMapper>(
        &mut self,
        virt: VirtAddr,
        new_size: usize,
        frames: &mut FrameBitmap,
        mapper: &M,
    ) -> Result<VirtAddr, AllocError> {
        assert!(new_size > 0, "zero-byte kernel heap reallocation");
        let new_pages = new_size.div_ceil(PAGE_SIZE as usize);
        let slot = self.live_slot(virt);
        assert!(
            !self.entries[slot].mmio(),
            "reallocate of a physical-memory mapping at {virt}"
        );
        let old_pages = self.run_tails[slot] as usize + 1;

        if new_pages == old_pages {
            return Ok(virt);
        }

        if new_pages < old_pages {
            for k in new_pages..old_pages {
                self.release_slot(slot + k, frames);
            }
            self.run_tails[slot] = (new_pages - 1) as u32;
            return Ok(virt);
        }

        // Grow in place when the tail slots are free. Extension pages are
        // demand-backed, so this path cannot fail partway.
        if slot + new_pages <= KERNEL_HEAP_PAGES
            && (old_pages..new_pages).all(|k| !self.entries[slot + k].is_occupied())
        {
            for k in old_pages..new_pages {
                self.demand_slot(slot + k);
            }
            self.run_tails[slot] = (new_pages - 1) as u32;
            return Ok(virt);
        }

        // Move: build the new run first, then free the old one.
        let start = self
            .find_run(new_pages)
            .ok_or(AllocError::NoContiguousRun(new_pages))?;
        for k in 0..new_pages {
            let old = if k < old_pages {
                self.entries[slot + k]
            } else {
                PageEntry::zero()
            };
            if old.present() {
                debug_assert!(!old.mmio());
                match self.commit_slot(start + k, frames, mapper) {
                    Ok(frame) => copy_frame(mapper, old.frame(), frame),
                    Err(e) => {
                        for j in (0..k).rev() {
                            self.release_slot(start + j, frames);
                        }
                        return Err(e);
                    }
                }
            } else {
                self.demand_slot(start + k);
            }
        }
        self.run_tails[start] = (new_pages - 1) as u32;
        self.cursor = (start + new_pages) % KERNEL_HEAP_PAGES;

        for k in 0..old_pages {
            self.release_slot(slot + k, frames);
        }
        Ok(Self::va_of(start))
    }

    /// Free the allocation at `virt`: the recorded run length decides how
    /// many consecutive pages go. Present non-MMIO pages release their
    /// frame; demand pages that were never touched release nothing; MMIO
    /// pages are unmapped without touching the frame allocator.
    ///
    /// # Panics
    ///
    /// If `virt` does not point at a live heap allocation.
    pub fn free(&mut self, virt: VirtAddr, frames: &mut FrameBitmap) {
        let slot = self.live_slot(virt);
        let tail = self.run_tails[slot] as usize;
        for k in 0..=tail {
            self.release_slot(slot + k, frames);
        }
    }

    /// Map `pages` physical frames starting at `base`'s frame into the
    /// heap window as MMIO: PRESENT immediately, exempt from frame and
    /// reference-count bookkeeping. The returned address carries `base`'s
    /// byte offset. [`Self::free`] unmaps it.
    ///
    /// # Errors
    ///
    /// [`AllocError::HeapExhausted`] / [`AllocError::NoContiguousRun`]
    /// when no suitable slot run exists.
    pub fn map_physical(
        &mut self,
        base: PhysAddr,
        pages: usize,
        read_write: bool,
    ) -> Result<VirtAddr, AllocError> {
        assert!(pages > 0, "zero-page physical-memory mapping");
        let start = self.find_run(pages).ok_or(if pages == 1 {
            AllocError::HeapExhausted
        } else {
            AllocError::NoContiguousRun(pages)
        })?;

        for k in 0..pages {
            let frame = FrameIndex(base.frame().as_u32() + k as u32);
            self.entries[start + k] = PageEntry::new()
                .with_present(true)
                .with_writable(read_write)
                .with_cache_disabled(true)
                .with_global_translation(true)
                .with_mmio(true)
                .with_frame(frame);
            self.run_tails[start + k] = 0;
            self.used += 1;
            invalidate_tlb_page(Self::va_of(start + k));
        }
        self.run_tails[start] = (pages - 1) as u32;
        self.cursor = (start + pages) % KERNEL_HEAP_PAGES;
        Ok(VirtAddr(
            Self::va_of(start).as_u32() + base.page_offset(),
        ))
    }

    #[must_use]
    pub const fn stats(&self) -> HeapStats {
        HeapStats {
            resident_pages: self.resident,
            used_slots: self.used,
            free_slots: KERNEL_HEAP_PAGES - self.used,
        }
    }

    /// Run-length bookkeeping for the allocation at `virt`: pages beyond
    /// the first. Debugging/introspection aid.
    #[must_use]
    pub fn allocation_tail_pages(&self, virt: VirtAddr) -> Option<u32> {
        let slot = Self::slot_of(virt)?;
        self.entries[slot]
            .is_occupied()
            .then(|| self.run_tails[slot])
    }

    /// The entry backing `virt`, if `virt` falls inside the heap window.
    pub(crate) fn entry_at(&self, virt: VirtAddr) -> Option<PageEntry> {
        Self::slot_of(virt).map(|slot| self.entries[slot])
    }

    /// Fault-path commit: attach a fresh zeroed frame to a demand entry,
    /// flipping it PRESENT. The slot stays part of its allocation run.
    pub(crate) fn commit_demand_entry<M: PhysMapper>(
        &mut self,
        virt: VirtAddr,
        frames: &mut FrameBitmap,
        mapper: &M,
    ) -> Result<(), AllocError> {
        let slot = self.live_slot(virt);
        let entry = self.entries[slot];
        debug_assert!(entry.demand() && !entry.present());

        let frame = frames.find_free_frame().ok_or(AllocError::OutOfFrames)?;
        frames.set_frame(frame);
        zero_frame(mapper, frame);
        self.entries[slot] = entry
            .with_demand(false)
            .with_present(true)
            .with_frame(frame);
        self.resident += 1;
        invalidate_tlb_page(virt.align_down());
        Ok(())
    }

    fn live_slot(&self, virt: VirtAddr) -> usize {
        let Some(slot) = Self::slot_of(virt) else {
            panic!("kernel heap address outside the heap window: {virt}");
        };
        assert!(
            self.entries[slot].is_occupied(),
            "kernel heap access to unallocated address {virt}"
        );
        slot
    }

    fn slot_of(virt: VirtAddr) -> Option<usize> {
        let addr = virt.as_u32();
        (KERNEL_HEAP_BASE..KERNEL_HEAP_END)
            .contains(&addr)
            .then(|| ((addr - KERNEL_HEAP_BASE) >> PAGE_SHIFT) as usize)
    }

    const fn va_of(slot: usize) -> VirtAddr {
        VirtAddr(KERNEL_HEAP_BASE + ((slot as u32) << PAGE_SHIFT))
    }

    /// First run of `pages` consecutive free slots, searching from the
    /// cursor and wrapping once. Runs never straddle the window end.
    fn find_run(&self, pages: usize) -> Option<usize> {
        let mut start = self.cursor % KERNEL_HEAP_PAGES;
        let mut scanned = 0usize;
        'candidate: while scanned < KERNEL_HEAP_PAGES {
            if start + pages > KERNEL_HEAP_PAGES {
                scanned += KERNEL_HEAP_PAGES - start;
                start = 0;
                continue;
            }
            for k in 0..pages {
                if self.entries[start + k].is_occupied() {
                    scanned += k + 1;
                    start += k + 1;
                    if start >= KERNEL_HEAP_PAGES {
                        start = 0;
                    }
                    continue 'candidate;
                }
            }
            return Some(start);
        }
        None
    }

    fn commit_slot<M: PhysMapper>(
        &mut self,
        slot: usize,
        frames: &mut FrameBitmap,
        mapper: &M,
    ) -> Result<FrameIndex, AllocError> {
        let frame = frames.find_free_frame().ok_or(AllocError::OutOfFrames)?;
        frames.set_frame(frame);
        zero_frame(mapper, frame);
        self.entries[slot] = PageEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_global_translation(true)
            .with_frame(frame);
        self.run_tails[slot] = 0;
        self.resident += 1;
        self.used += 1;
        invalidate_tlb_page(Self::va_of(slot));
        Ok(frame)
    }

    fn demand_slot(&mut self, slot: usize) {
        self.entries[slot] = PageEntry::new().with_demand(true).with_writable(true);
        self.run_tails[slot] = 0;
        self.used += 1;
        invalidate_tlb_page(Self::va_of(slot));
    }

    fn release_slot(&mut self, slot: usize, frames: &mut FrameBitmap) {
        let entry = self.entries[slot];
        if entry.is_counted() {
            frames.clear_frame(entry.frame());
            self.resident -= 1;
        }
        if entry.is_occupied() {
            self.used -= 1;
        }
        self.entries[slot] = PageEntry::zero();
        self.run_tails[slot] = 0;
        invalidate_tlb_page(Self::va_of(slot));
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}
