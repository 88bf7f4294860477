//! # Frame Reference Counts
//!
//! Two-level sparse table of per-frame share counts: a root of 1024
//! optional level-1 blocks, each one kernel-heap page holding 1024 `u32`
//! counters. A frame index splits into two 10-bit halves to address it.
//! Blocks appear lazily on the first reference into their range and are
//! given back to the heap when their last counter drops to zero.
//!
//! Only user-space frames are counted here. Kernel-heap frames are
//! exempt — which is exactly why the blocks themselves, being heap
//! pages, don't recurse into this table.
//!
//! The table stores a block's *location*; the counters live in the
//! block's physical frame and are reached through the [`PhysMapper`],
//! like every other page-sized structure in this subsystem.

use crate::frame_alloc::FrameBitmap;
use crate::heap::{HeapPage, KernelHeap};
use crate::AllocError;
use kernel_info::memory::PAGE_SIZE;
use kernel_vmem::{FrameIndex, PhysMapper};

const BLOCK_COUNTERS: usize = 1024;
const ROOT_SLOTS: usize = 1024;

/// One level-1 block: 1024 counters, exactly one page.
#[repr(C, align(4096))]
struct CountBlock {
    counts: [u32; BLOCK_COUNTERS],
}

const _: () = assert!(size_of::<CountBlock>() == PAGE_SIZE as usize);

struct BlockSlot {
    page: HeapPage,
    /// Non-zero counters in this block; the block is freed at zero.
    live: u32,
}

pub struct RefCountTable {
    blocks: [Option<BlockSlot>; ROOT_SLOTS],
    /// Distinct frames with a non-zero count, across all blocks.
    referenced: usize,
}

impl RefCountTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            blocks: [const { None }; ROOT_SLOTS],
            referenced: 0,
        }
    }

    /// Current share count of `frame`; 0 when no block covers it.
    #[must_use]
    pub fn count<M: PhysMapper>(&self, frame: FrameIndex, mapper: &M) -> u32 {
        let (root, index) = Self::split(frame);
        match &self.blocks[root] {
            Some(slot) => Self::counters(slot, mapper).counts[index],
            None => 0,
        }
    }

    /// Increment `frame`'s share count, materializing the covering block
    /// if needed. Returns the new count.
    ///
    /// # Errors
    ///
    /// Propagates heap/frame exhaustion from block allocation.
    pub fn reference<M: PhysMapper>(
        &mut self,
        frame: FrameIndex,
        heap: &mut KernelHeap,
        frames: &mut FrameBitmap,
        mapper: &M,
    ) -> Result<u32, AllocError> {
        let (root, index) = Self::split(frame);
        let slot = match &mut self.blocks[root] {
            Some(slot) => slot,
            empty => {
                // One committed heap page, already zeroed on commit.
                let page = heap.allocate_page(frames, mapper)?;
                log::trace!("refcount: new block {root} at {}", page.virt);
                empty.insert(BlockSlot { page, live: 0 })
            }
        };

        let counts = &mut Self::counters(slot, mapper).counts;
        counts[index] += 1;
        if counts[index] == 1 {
            slot.live += 1;
            self.referenced += 1;
        }
        Ok(counts[index])
    }

    /// Decrement `frame`'s share count and return the remainder. Frees
    /// the covering block when its last counter reaches zero.
    ///
    /// # Panics
    ///
    /// A decrement without a covering block, or of a counter already at
    /// zero, is a double-unreference: a kernel bug, fatal by design.
    pub fn unreference<M: PhysMapper>(
        &mut self,
        frame: FrameIndex,
        heap: &mut KernelHeap,
        frames: &mut FrameBitmap,
        mapper: &M,
    ) -> u32 {
        let (root, index) = Self::split(frame);
        let Some(slot) = self.blocks[root].as_mut() else {
            panic!("unreference of uncounted frame {frame:?}");
        };

        let counts = &mut Self::counters(slot, mapper).counts;
        assert!(
            counts[index] > 0,
            "unreference of frame {frame:?} whose count is already zero"
        );
        counts[index] -= 1;
        let remaining = counts[index];
        if remaining == 0 {
            slot.live -= 1;
            self.referenced -= 1;
            if slot.live == 0 {
                let page = slot.page;
                self.blocks[root] = None;
                heap.free(page.virt, frames);
                log::trace!("refcount: reclaimed block {root}");
            }
        }
        remaining
    }

    /// Distinct frames currently shared at least once.
    #[must_use]
    pub const fn referenced_frames(&self) -> usize {
        self.referenced
    }

    const fn split(frame: FrameIndex) -> (usize, usize) {
        let index = frame.as_usize();
        (index >> 10, index & 0x3ff)
    }

    fn counters<'a, M: PhysMapper>(slot: &BlockSlot, mapper: &M) -> &'a mut CountBlock {
        // Counters live in the block's frame; the heap committed and
        // zeroed it, so the bytes are always a valid CountBlock.
        unsafe { mapper.phys_to_mut::<CountBlock>(slot.page.frame.base()) }
    }
}

impl Default for RefCountTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::PhysAddr;

    #[repr(align(4096))]
    struct Aligned4K([u8; PAGE_SIZE as usize]);

    struct TestPhys {
        frames: Vec<core::cell::UnsafeCell<Aligned4K>>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(core::cell::UnsafeCell::new(Aligned4K([0; PAGE_SIZE as usize])));
            }
            Self { frames }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let idx = (pa.as_u32() >> 12) as usize;
            let ptr = self.frames[idx].get().cast::<T>();
            unsafe { &mut *ptr }
        }
    }

    fn setup(n_frames: usize) -> (TestPhys, FrameBitmap, KernelHeap, RefCountTable) {
        let phys = TestPhys::with_frames(n_frames);
        let mut frames = FrameBitmap::new_fully_reserved();
        for f in 1..n_frames {
            frames.clear_frame(FrameIndex(f as u32));
        }
        (phys, frames, KernelHeap::new(), RefCountTable::new())
    }

    #[test]
    fn counts_rise_and_fall() {
        let (phys, mut frames, mut heap, mut table) = setup(8);
        let frame = FrameIndex(5);

        assert_eq!(table.count(frame, &phys), 0);
        assert_eq!(
            table
                .reference(frame, &mut heap, &mut frames, &phys)
                .unwrap(),
            1
        );
        assert_eq!(
            table
                .reference(frame, &mut heap, &mut frames, &phys)
                .unwrap(),
            2
        );
        assert_eq!(table.referenced_frames(), 1);

        assert_eq!(table.unreference(frame, &mut heap, &mut frames, &phys), 1);
        assert_eq!(table.count(frame, &phys), 1);
    }

    #[test]
    fn block_is_reclaimed_when_empty() {
        let (phys, mut frames, mut heap, mut table) = setup(8);
        let free_before = frames.free_frames();

        table
            .reference(FrameIndex(3), &mut heap, &mut frames, &phys)
            .unwrap();
        // one heap page consumed for the block
        assert_eq!(frames.free_frames(), free_before - 1);
        assert_eq!(heap.stats().used_slots, 1);

        table.unreference(FrameIndex(3), &mut heap, &mut frames, &phys);
        assert_eq!(frames.free_frames(), free_before);
        assert_eq!(heap.stats().used_slots, 0);
        assert_eq!(table.referenced_frames(), 0);
    }

    #[test]
    fn distant_frames_use_distinct_blocks() {
        let (phys, mut frames, mut heap, mut table) = setup(8);

        table
            .reference(FrameIndex(1), &mut heap, &mut frames, &phys)
            .unwrap();
        table
            .reference(FrameIndex(5 << 10), &mut heap, &mut frames, &phys)
            .unwrap();
        assert_eq!(heap.stats().used_slots, 2);
        assert_eq!(table.referenced_frames(), 2);
    }

    #[test]
    #[should_panic(expected = "already zero")]
    fn double_unreference_is_fatal() {
        let (phys, mut frames, mut heap, mut table) = setup(8);
        let frame = FrameIndex(2);
        // a second counted frame keeps the block alive past the decrement
        table
            .reference(FrameIndex(3), &mut heap, &mut frames, &phys)
            .unwrap();
        table
            .reference(frame, &mut heap, &mut frames, &phys)
            .unwrap();
        table.unreference(frame, &mut heap, &mut frames, &phys);
        table.unreference(frame, &mut heap, &mut frames, &phys);
    }

    #[test]
    #[should_panic(expected = "uncounted frame")]
    fn unreference_without_block_is_fatal() {
        let (phys, mut frames, mut heap, mut table) = setup(8);
        table.unreference(FrameIndex(7), &mut heap, &mut frames, &phys);
    }
}
