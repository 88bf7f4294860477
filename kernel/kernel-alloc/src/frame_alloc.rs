//! # Physical Frame Bitmap
//!
//! One bit per 4 KiB frame over the whole 32-bit physical space (1 Mi
//! frames, 128 KiB of bitmap). A set bit means the frame is reserved or
//! in use; covering the full space means firmware holes need no special
//! casing — absent RAM simply stays reserved.
//!
//! The bitmap only tracks *whether* a frame is taken. Who may release it
//! is decided above: user frames go through the reference-count table,
//! kernel-heap frames are freed directly.

use kernel_info::boot::{BootMemoryMap, PhysRange, RegionKind};
use kernel_info::memory::{PAGE_SIZE, TOTAL_FRAMES};
use kernel_vmem::FrameIndex;

const WORD_BITS: usize = 32;
const WORD_COUNT: usize = TOTAL_FRAMES / WORD_BITS;

pub struct FrameBitmap {
    /// Bit set ⇒ frame reserved or allocated.
    words: [u32; WORD_COUNT],
    free: usize,
}

impl FrameBitmap {
    /// A bitmap with every frame reserved. Boot code carves out the
    /// usable regions afterwards; tests use it directly.
    #[must_use]
    pub const fn new_fully_reserved() -> Self {
        Self {
            words: [u32::MAX; WORD_COUNT],
            free: 0,
        }
    }

    /// Build the bitmap from the firmware memory map: start fully
    /// reserved, release the available regions (aligned inward), then
    /// re-reserve the kernel image and boot modules (aligned outward).
    ///
    /// Frame 0 always stays reserved so that a zeroed page entry never
    /// names real memory.
    #[must_use]
    pub fn from_boot_map(map: &BootMemoryMap<'_>) -> Self {
        let mut bitmap = Self::new_fully_reserved();

        for region in map.regions {
            if region.kind != RegionKind::Available {
                continue;
            }
            let first = region.base.div_ceil(u64::from(PAGE_SIZE));
            let last = (region.base + region.length) / u64::from(PAGE_SIZE);
            for frame in first..last.min(TOTAL_FRAMES as u64) {
                bitmap.clear_frame(FrameIndex(frame as u32));
            }
        }

        bitmap.reserve_range(map.kernel_image);
        for module in map.modules {
            bitmap.reserve_range(*module);
        }
        bitmap.set_frame(FrameIndex(0));

        log::debug!(
            "frame bitmap initialized: {} of {} frames free",
            bitmap.free,
            TOTAL_FRAMES
        );
        bitmap
    }

    fn reserve_range(&mut self, range: PhysRange) {
        let first = range.start / u64::from(PAGE_SIZE);
        let last = range.end.div_ceil(u64::from(PAGE_SIZE));
        for frame in first..last.min(TOTAL_FRAMES as u64) {
            self.set_frame(FrameIndex(frame as u32));
        }
    }

    /// First free frame by linear word scan, lowest bit first.
    #[must_use]
    pub fn find_free_frame(&self) -> Option<FrameIndex> {
        for (word_index, &word) in self.words.iter().enumerate() {
            if word != u32::MAX {
                let bit = word.trailing_ones() as usize;
                return Some(FrameIndex((word_index * WORD_BITS + bit) as u32));
            }
        }
        None
    }

    /// Mark `frame` in use. Idempotent.
    pub const fn set_frame(&mut self, frame: FrameIndex) {
        let (word, mask) = Self::locate(frame);
        if self.words[word] & mask == 0 {
            self.words[word] |= mask;
            self.free -= 1;
        }
    }

    /// Mark `frame` free. Idempotent.
    pub const fn clear_frame(&mut self, frame: FrameIndex) {
        let (word, mask) = Self::locate(frame);
        if self.words[word] & mask != 0 {
            self.words[word] &= !mask;
            self.free += 1;
        }
    }

    #[must_use]
    pub const fn is_used(&self, frame: FrameIndex) -> bool {
        let (word, mask) = Self::locate(frame);
        self.words[word] & mask != 0
    }

    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free
    }

    #[must_use]
    pub const fn total_frames(&self) -> usize {
        TOTAL_FRAMES
    }

    const fn locate(frame: FrameIndex) -> (usize, u32) {
        let index = frame.as_usize();
        (index / WORD_BITS, 1 << (index % WORD_BITS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRegion;

    fn small_map(regions: &[MemoryRegion]) -> FrameBitmap {
        FrameBitmap::from_boot_map(&BootMemoryMap {
            regions,
            kernel_image: PhysRange::new(0x1000, 0x3000),
            modules: &[],
        })
    }

    #[test]
    fn boot_map_releases_available_and_rereserves_image() {
        let regions = [MemoryRegion {
            base: 0,
            length: 16 * 4096,
            kind: RegionKind::Available,
        }];
        let bitmap = small_map(&regions);

        // frame 0 pinned, frames 1-2 hold the kernel image
        assert!(bitmap.is_used(FrameIndex(0)));
        assert!(bitmap.is_used(FrameIndex(1)));
        assert!(bitmap.is_used(FrameIndex(2)));
        assert!(!bitmap.is_used(FrameIndex(3)));
        assert_eq!(bitmap.free_frames(), 13);
    }

    #[test]
    fn partial_regions_align_inward() {
        let regions = [MemoryRegion {
            base: 0x1800, // mid-frame start: only whole frames are usable
            length: 0x3000,
            kind: RegionKind::Available,
        }];
        // covers 0x1800..0x4800 => whole frames 2 and 3; frame 2 is re-reserved
        // by the kernel image range, leaving exactly frame 3 free.
        let bitmap = small_map(&regions);
        assert_eq!(bitmap.free_frames(), 1);
        assert!(!bitmap.is_used(FrameIndex(3)));
    }

    #[test]
    fn find_set_clear_round_trip() {
        let regions = [MemoryRegion {
            base: 0,
            length: 8 * 4096,
            kind: RegionKind::Available,
        }];
        let mut bitmap = small_map(&regions);

        let frame = bitmap.find_free_frame().unwrap();
        assert_eq!(frame, FrameIndex(3));
        bitmap.set_frame(frame);
        assert_eq!(bitmap.find_free_frame(), Some(FrameIndex(4)));

        let before = bitmap.free_frames();
        bitmap.clear_frame(frame);
        assert_eq!(bitmap.free_frames(), before + 1);
        // idempotent
        bitmap.clear_frame(frame);
        assert_eq!(bitmap.free_frames(), before + 1);
    }

    #[test]
    fn exhaustion_returns_none() {
        let bitmap = FrameBitmap::new_fully_reserved();
        assert_eq!(bitmap.find_free_frame(), None);
        assert_eq!(bitmap.free_frames(), 0);
    }
}
