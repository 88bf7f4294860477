//! End-to-end scenarios against an in-memory frame arena: demand
//! paging, copy-on-write forks, transactional mapping, heap lifecycle
//! and the frame-conservation ledger.

use kernel_alloc::{
    AllocError, ClobberPolicy, FaultError, FaultResolution, FrameOwner, HeapBacking, MapError,
    MapPlacement, MemoryManager, Registers,
};
use kernel_info::boot::{BootMemoryMap, MemoryRegion, PhysRange, RegionKind};
use kernel_info::memory::{KERNEL_SPACE_BASE, PAGE_SIZE, USER_DYNAMIC_BASE};
use kernel_vmem::{FrameIndex, PhysAddr, PhysMapper, VirtAddr};

const ARENA_FRAMES: usize = 64;
/// Boot-reserved directory standing in for the kernel template.
const TEMPLATE_FRAME: FrameIndex = FrameIndex(1);

/// Not-present fault, user write. Only the PRESENT and WRITE bits
/// matter to the handler.
const NOT_PRESENT_WRITE: u32 = 0b110;
const NOT_PRESENT_READ: u32 = 0b100;
/// Protection fault, user write: the copy-on-write trigger.
const PROTECTION_WRITE: u32 = 0b111;

#[repr(align(4096))]
struct Aligned4K([u8; PAGE_SIZE as usize]);

struct TestPhys {
    frames: Vec<core::cell::UnsafeCell<Aligned4K>>,
}

impl TestPhys {
    fn new() -> Self {
        let mut frames = Vec::with_capacity(ARENA_FRAMES);
        for _ in 0..ARENA_FRAMES {
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

/// A manager over the whole arena, frames 0 (null) and 1 (template)
/// reserved. 62 frames free at the start of every test.
fn manager(phys: &TestPhys) -> MemoryManager<'_, TestPhys> {
    let regions = [MemoryRegion {
        base: 0,
        length: (ARENA_FRAMES as u64) * u64::from(PAGE_SIZE),
        kind: RegionKind::Available,
    }];
    let boot = BootMemoryMap {
        regions: &regions,
        kernel_image: PhysRange::new(0x1000, 0x2000),
        modules: &[],
    };
    MemoryManager::new(phys, &boot, TEMPLATE_FRAME)
}

fn fault<M: PhysMapper>(
    mm: &mut MemoryManager<'_, M>,
    va: u32,
    error_code: u32,
) -> Result<FaultResolution, FaultError> {
    let regs = Registers {
        cr2: va,
        error_code,
        eip: 0x0804_8000,
        ..Registers::default()
    };
    mm.handle_page_fault(&regs)
}

fn frame_byte(phys: &TestPhys, frame: FrameIndex, offset: usize) -> u8 {
    let bytes: &[u8; PAGE_SIZE as usize] = unsafe { phys.phys_to_mut(frame.base()) };
    bytes[offset]
}

fn set_frame_byte(phys: &TestPhys, frame: FrameIndex, offset: usize, value: u8) {
    let bytes: &mut [u8; PAGE_SIZE as usize] = unsafe { phys.phys_to_mut(frame.base()) };
    bytes[offset] = value;
}

const BASE: VirtAddr = VirtAddr(0x4010_0000);

#[test]
fn demand_mapping_is_lazy() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let space = mm.create_address_space().unwrap();
    mm.activate(&space);

    // Warm up the page table covering BASE so the mapping itself has no
    // bookkeeping left to allocate.
    mm.map_user(&space, MapPlacement::Fixed(BASE), 1, None, true, ClobberPolicy::Fail, false)
        .unwrap();
    mm.unmap_user(&space, BASE, 1).unwrap();

    let free_before = mm.free_frames();
    mm.map_user(&space, MapPlacement::Fixed(BASE), 4, None, true, ClobberPolicy::Fail, false)
        .unwrap();
    assert_eq!(mm.free_frames(), free_before, "demand mapping must not consume frames");

    for i in 0..4 {
        let entry = mm.user_entry(&space, BASE.add_pages(i)).unwrap();
        assert!(entry.demand() && !entry.present());
    }

    // First touch pays for the page itself plus the first refcount
    // block; later touches are one frame each.
    assert_eq!(fault(&mut mm, BASE.as_u32() + 3, NOT_PRESENT_WRITE), Ok(FaultResolution::DemandPaged));
    assert_eq!(mm.free_frames(), free_before - 2);
    assert_eq!(fault(&mut mm, BASE.add_pages(1).as_u32(), NOT_PRESENT_READ), Ok(FaultResolution::DemandPaged));
    assert_eq!(mm.free_frames(), free_before - 3);

    let touched = mm.user_entry(&space, BASE).unwrap();
    assert!(touched.present() && !touched.demand() && touched.writable());
    assert_eq!(mm.frame_ref_count(touched.frame()), 1);
    // the frame arrived zeroed
    assert_eq!(frame_byte(&phys, touched.frame(), 123), 0);

    let untouched = mm.user_entry(&space, BASE.add_pages(2)).unwrap();
    assert!(untouched.demand());
}

#[test]
fn cow_clone_shares_then_splits() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let parent = mm.create_address_space().unwrap();
    mm.activate(&parent);

    mm.map_user(&parent, MapPlacement::Fixed(BASE), 1, None, true, ClobberPolicy::Fail, false)
        .unwrap();
    assert_eq!(fault(&mut mm, BASE.as_u32(), NOT_PRESENT_WRITE), Ok(FaultResolution::DemandPaged));
    let shared = mm.user_entry(&parent, BASE).unwrap().frame();
    set_frame_byte(&phys, shared, 7, 0x5A);

    let child = mm.clone_address_space(&parent).unwrap();

    // Both sides now read-only COW aliases of the same frame.
    assert_eq!(mm.frame_ref_count(shared), 2);
    for space in [&parent, &child] {
        let entry = mm.user_entry(space, BASE).unwrap();
        assert!(entry.present() && entry.copy_on_write() && !entry.writable());
        assert_eq!(entry.frame(), shared);
    }

    // Child writes: private copy, parent untouched.
    mm.activate(&child);
    assert_eq!(fault(&mut mm, BASE.as_u32() + 7, PROTECTION_WRITE), Ok(FaultResolution::CowCopied));
    let child_entry = mm.user_entry(&child, BASE).unwrap();
    assert!(child_entry.writable() && !child_entry.copy_on_write());
    assert_ne!(child_entry.frame(), shared);
    assert_eq!(frame_byte(&phys, child_entry.frame(), 7), 0x5A, "copy must carry the contents");
    assert_eq!(mm.frame_ref_count(shared), 1);
    assert_eq!(mm.frame_ref_count(child_entry.frame()), 1);

    // Parent writes as the remaining sole owner: promoted in place.
    mm.activate(&parent);
    let free_before = mm.free_frames();
    assert_eq!(fault(&mut mm, BASE.as_u32(), PROTECTION_WRITE), Ok(FaultResolution::CowPromoted));
    assert_eq!(mm.free_frames(), free_before, "promotion allocates nothing");
    let parent_entry = mm.user_entry(&parent, BASE).unwrap();
    assert!(parent_entry.writable() && !parent_entry.copy_on_write());
    assert_eq!(parent_entry.frame(), shared);
    assert_eq!(frame_byte(&phys, shared, 7), 0x5A);

    mm.activate_kernel_only();
    mm.destroy_address_space(child);
    mm.destroy_address_space(parent);
    assert_eq!(mm.referenced_frames(), 0);
}

#[test]
fn clone_covers_demand_entries_verbatim() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let parent = mm.create_address_space().unwrap();

    mm.map_user(&parent, MapPlacement::Fixed(BASE), 2, None, true, ClobberPolicy::Fail, false)
        .unwrap();
    let child = mm.clone_address_space(&parent).unwrap();

    // Demand entries carry no frame to share; each side faults its own.
    for space in [&parent, &child] {
        let entry = mm.user_entry(space, BASE).unwrap();
        assert!(entry.demand() && !entry.copy_on_write());
    }
    mm.activate(&child);
    assert_eq!(fault(&mut mm, BASE.as_u32(), NOT_PRESENT_WRITE), Ok(FaultResolution::DemandPaged));
    assert!(mm.user_entry(&parent, BASE).unwrap().demand());

    mm.activate_kernel_only();
    mm.destroy_address_space(child);
    mm.destroy_address_space(parent);
}

#[test]
fn fixed_mapping_rolls_back_under_fail_policy() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let space = mm.create_address_space().unwrap();

    let blocker = BASE.add_pages(2);
    mm.map_user(&space, MapPlacement::Fixed(blocker), 1, None, true, ClobberPolicy::Fail, false)
        .unwrap();

    let free_before = mm.free_frames();
    let result = mm.map_user(&space, MapPlacement::Fixed(BASE), 4, None, true, ClobberPolicy::Fail, false);
    assert_eq!(result, Err(MapError::AlreadyMapped(blocker)));
    assert_eq!(mm.free_frames(), free_before);

    // Nothing of the failed request survives; the blocker does.
    for i in [0, 1, 3] {
        let entry = mm.user_entry(&space, BASE.add_pages(i)).unwrap();
        assert!(!entry.present() && !entry.demand());
    }
    assert!(mm.user_entry(&space, blocker).unwrap().demand());
}

#[test]
fn supplied_frames_are_reference_counted() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let space = mm.create_address_space().unwrap();

    let f0 = mm.request_frame(FrameOwner::UserSpace).unwrap();
    let f1 = mm.request_frame(FrameOwner::UserSpace).unwrap();
    mm.map_user(
        &space,
        MapPlacement::Fixed(BASE),
        2,
        Some(&[f0, f1]),
        true,
        ClobberPolicy::Fail,
        false,
    )
    .unwrap();
    // acquisition reference + mapping reference
    assert_eq!(mm.frame_ref_count(f0), 2);
    assert_eq!(mm.frame_ref_count(f1), 2);

    mm.release_frame(f0, FrameOwner::UserSpace);
    mm.release_frame(f1, FrameOwner::UserSpace);
    assert_eq!(mm.frame_ref_count(f0), 1);
    assert!(mm.user_entry(&space, BASE).unwrap().present());

    mm.unmap_user(&space, BASE, 2).unwrap();
    assert_eq!(mm.frame_ref_count(f0), 0);
    assert_eq!(mm.referenced_frames(), 0);
    mm.destroy_address_space(space);
}

#[test]
fn skip_existing_leaves_collisions_with_the_caller() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let space = mm.create_address_space().unwrap();

    mm.map_user(&space, MapPlacement::Fixed(BASE.add_pages(1)), 1, None, true, ClobberPolicy::Fail, false)
        .unwrap();

    let f0 = mm.request_frame(FrameOwner::UserSpace).unwrap();
    let f1 = mm.request_frame(FrameOwner::UserSpace).unwrap();
    let f2 = mm.request_frame(FrameOwner::UserSpace).unwrap();
    mm.map_user(
        &space,
        MapPlacement::Fixed(BASE),
        3,
        Some(&[f0, f1, f2]),
        true,
        ClobberPolicy::SkipExisting,
        false,
    )
    .unwrap();

    assert_eq!(mm.user_entry(&space, BASE).unwrap().frame(), f0);
    assert!(mm.user_entry(&space, BASE.add_pages(1)).unwrap().demand());
    assert_eq!(mm.user_entry(&space, BASE.add_pages(2)).unwrap().frame(), f2);

    // The skipped page's frame was never referenced by the mapping and
    // stays the caller's to release.
    assert_eq!(mm.frame_ref_count(f1), 1);
    mm.release_frame(f1, FrameOwner::UserSpace);
    assert_eq!(mm.frame_ref_count(f1), 0);
}

#[test]
fn overwrite_drops_the_old_frame() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let space = mm.create_address_space().unwrap();

    let f = mm.request_frame(FrameOwner::UserSpace).unwrap();
    mm.map_user(&space, MapPlacement::Fixed(BASE), 1, Some(&[f]), true, ClobberPolicy::Fail, false)
        .unwrap();
    mm.release_frame(f, FrameOwner::UserSpace);
    assert_eq!(mm.frame_ref_count(f), 1);

    mm.map_user(&space, MapPlacement::Fixed(BASE), 1, None, true, ClobberPolicy::Overwrite, false)
        .unwrap();
    assert_eq!(mm.frame_ref_count(f), 0, "overwrite releases the displaced frame");
    assert!(mm.user_entry(&space, BASE).unwrap().demand());
}

#[test]
fn unmap_tolerates_holes_and_repeats() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let space = mm.create_address_space().unwrap();

    mm.map_user(&space, MapPlacement::Fixed(BASE), 3, None, true, ClobberPolicy::Fail, false)
        .unwrap();
    mm.unmap_user(&space, BASE.add_pages(1), 1).unwrap();
    // re-unmapping the hole and overshooting the mapping are both fine
    mm.unmap_user(&space, BASE, 8).unwrap();
    mm.unmap_user(&space, BASE, 8).unwrap();

    for i in 0..3 {
        let entry = mm.user_entry(&space, BASE.add_pages(i)).unwrap();
        assert!(!entry.present() && !entry.demand());
    }
}

#[test]
fn user_operations_reject_the_kernel_half() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let space = mm.create_address_space().unwrap();

    assert_eq!(
        mm.map_user(
            &space,
            MapPlacement::Fixed(VirtAddr(KERNEL_SPACE_BASE)),
            1,
            None,
            true,
            ClobberPolicy::Fail,
            false,
        ),
        Err(MapError::OutOfRange)
    );
    assert_eq!(
        mm.map_user(
            &space,
            MapPlacement::Fixed(VirtAddr(KERNEL_SPACE_BASE - PAGE_SIZE)),
            2,
            None,
            true,
            ClobberPolicy::Fail,
            false,
        ),
        Err(MapError::OutOfRange)
    );
    assert_eq!(
        mm.unmap_user(&space, VirtAddr(KERNEL_SPACE_BASE), 1),
        Err(MapError::OutOfRange)
    );
}

#[test]
fn searched_placement_advances_and_wraps() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let space = mm.create_address_space().unwrap();

    let first = mm
        .map_user(&space, MapPlacement::Anywhere, 2, None, true, ClobberPolicy::Fail, false)
        .unwrap();
    assert_eq!(first, VirtAddr(USER_DYNAMIC_BASE));
    let second = mm
        .map_user(&space, MapPlacement::Anywhere, 2, None, true, ClobberPolicy::Fail, false)
        .unwrap();
    assert_eq!(second, first.add_pages(2));

    // Near the very top there is no room for four pages; the search
    // wraps around the dynamic area.
    let wrapped = mm
        .map_user(
            &space,
            MapPlacement::Near(VirtAddr(KERNEL_SPACE_BASE - 2 * PAGE_SIZE)),
            4,
            None,
            true,
            ClobberPolicy::Fail,
            false,
        )
        .unwrap();
    assert_eq!(wrapped, second.add_pages(2));

    // A hint below the dynamic area is clamped into it.
    let clamped = mm
        .map_user(&space, MapPlacement::Near(VirtAddr(0x1000)), 1, None, true, ClobberPolicy::Fail, false)
        .unwrap();
    assert_eq!(clamped, wrapped.add_pages(4));
}

#[test]
fn mmio_mappings_bypass_frame_accounting() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let space = mm.create_address_space().unwrap();

    assert_eq!(
        mm.map_user(&space, MapPlacement::Fixed(BASE), 1, None, true, ClobberPolicy::Fail, true),
        Err(MapError::MmioNeedsFrames)
    );

    let lapic = FrameIndex(0xFEE00);
    mm.map_user(&space, MapPlacement::Fixed(BASE), 1, Some(&[lapic]), true, ClobberPolicy::Fail, true)
        .unwrap();
    let free_after_map = mm.free_frames();

    let entry = mm.user_entry(&space, BASE).unwrap();
    assert!(entry.present() && entry.mmio() && entry.cache_disabled());
    assert_eq!(entry.frame(), lapic);
    assert_eq!(mm.frame_ref_count(lapic), 0, "device frames are never counted");

    mm.unmap_user(&space, BASE, 1).unwrap();
    assert_eq!(mm.free_frames(), free_after_map, "unmap must not free a device frame");
}

#[test]
fn spurious_and_invalid_faults_are_classified() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);

    // No active space: user addresses have no directory to walk.
    assert_eq!(fault(&mut mm, BASE.as_u32(), NOT_PRESENT_READ), Err(FaultError::NotMapped));

    let space = mm.create_address_space().unwrap();
    mm.activate(&space);

    // Untouched user half and the kernel image never resolve.
    assert_eq!(fault(&mut mm, 0x4500_0000, NOT_PRESENT_READ), Err(FaultError::NotMapped));
    assert_eq!(fault(&mut mm, 0xC010_0000, NOT_PRESENT_READ), Err(FaultError::NotMapped));

    // A present, valid entry faulting not-present is a stale TLB line.
    let f = mm.request_frame(FrameOwner::UserSpace).unwrap();
    mm.map_user(&space, MapPlacement::Fixed(BASE), 1, Some(&[f]), true, ClobberPolicy::Fail, false)
        .unwrap();
    mm.release_frame(f, FrameOwner::UserSpace);
    assert_eq!(fault(&mut mm, BASE.as_u32(), NOT_PRESENT_READ), Ok(FaultResolution::Spurious));

    // Writing a read-only, non-COW page is a real violation.
    let g = mm.request_frame(FrameOwner::UserSpace).unwrap();
    let ro = BASE.add_pages(1);
    mm.map_user(&space, MapPlacement::Fixed(ro), 1, Some(&[g]), false, ClobberPolicy::Fail, false)
        .unwrap();
    mm.release_frame(g, FrameOwner::UserSpace);
    assert_eq!(fault(&mut mm, ro.as_u32(), PROTECTION_WRITE), Err(FaultError::AccessViolation));

    assert_eq!(mm.page_fault_count(), 5);
}

#[test]
fn kernel_heap_demand_pages_commit_on_fault() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);

    let free_before = mm.free_frames();
    let alloc = mm.heap_allocate(3 * PAGE_SIZE as usize, HeapBacking::Demand).unwrap();
    assert_eq!(alloc.phys, None);
    assert_eq!(mm.free_frames(), free_before);

    assert_eq!(fault(&mut mm, alloc.virt.as_u32() + 16, NOT_PRESENT_WRITE), Ok(FaultResolution::DemandPaged));
    assert_eq!(mm.free_frames(), free_before - 1);
    assert_eq!(mm.heap().stats().resident_pages, 1);

    // An unallocated heap slot stays fatal.
    let beyond = alloc.virt.add_pages(3);
    assert_eq!(fault(&mut mm, beyond.as_u32(), NOT_PRESENT_READ), Err(FaultError::NotMapped));

    mm.heap_free(alloc.virt);
    assert_eq!(mm.free_frames(), free_before);
}

#[test]
fn two_page_heap_allocation_lifecycle() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);

    let free_before = mm.free_frames();
    let alloc = mm.heap_allocate(8192, HeapBacking::Committed).unwrap();
    assert_eq!(alloc.virt.page_offset(), 0);
    assert_eq!(mm.heap().allocation_tail_pages(alloc.virt), Some(1));
    assert_eq!(mm.free_frames(), free_before - 2);

    mm.heap_free(alloc.virt);
    assert_eq!(mm.free_frames(), free_before);
    assert_eq!(mm.heap().stats().used_slots, 0);
}

#[test]
fn clone_failure_leaves_the_source_intact() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let parent = mm.create_address_space().unwrap();

    let f = mm.request_frame(FrameOwner::UserSpace).unwrap();
    mm.map_user(&parent, MapPlacement::Fixed(BASE), 1, Some(&[f]), true, ClobberPolicy::Fail, false)
        .unwrap();
    mm.release_frame(f, FrameOwner::UserSpace);

    // Drain physical memory down to a single frame: enough for the
    // clone's directory, not for its first page table.
    let drain = mm
        .heap_allocate((mm.free_frames() - 1) * PAGE_SIZE as usize, HeapBacking::Committed)
        .unwrap();

    assert_eq!(mm.clone_address_space(&parent), Err(AllocError::OutOfFrames));
    assert_eq!(mm.free_frames(), 1, "the partial clone was torn down");

    // The failure struck before any source entry was flipped.
    let entry = mm.user_entry(&parent, BASE).unwrap();
    assert!(entry.present() && entry.writable() && !entry.copy_on_write());
    assert_eq!(mm.frame_ref_count(f), 1);

    mm.heap_free(drain.virt);
    mm.destroy_address_space(parent);
}

#[test]
fn shared_space_survives_until_the_last_owner() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let baseline = mm.free_frames();

    let space = mm.create_address_space().unwrap();
    mm.map_user(&space, MapPlacement::Fixed(BASE), 1, None, true, ClobberPolicy::Fail, false)
        .unwrap();

    // A second thread attaches to the same space.
    assert_eq!(space.reference(), 2);

    let free_before = mm.free_frames();
    let space = mm
        .destroy_address_space(space)
        .expect("an owner remains, the space must survive");
    assert_eq!(mm.free_frames(), free_before, "teardown is deferred");
    assert_eq!(space.share_count(), 1);
    assert!(mm.user_entry(&space, BASE).unwrap().demand());

    assert!(mm.destroy_address_space(space).is_none());
    assert_eq!(mm.free_frames(), baseline);
    assert_eq!(mm.referenced_frames(), 0);
}

#[test]
#[should_panic(expected = "active address space")]
fn destroying_the_active_space_is_fatal() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let space = mm.create_address_space().unwrap();
    mm.activate(&space);
    mm.destroy_address_space(space);
}

#[test]
fn frames_are_conserved_across_a_full_workout() {
    let phys = TestPhys::new();
    let mut mm = manager(&phys);
    let baseline = mm.free_frames();

    let heap_alloc = mm.heap_allocate(4 * PAGE_SIZE as usize, HeapBacking::Committed).unwrap();

    let parent = mm.create_address_space().unwrap();
    mm.activate(&parent);
    mm.map_user(&parent, MapPlacement::Fixed(BASE), 3, None, true, ClobberPolicy::Fail, false)
        .unwrap();
    fault(&mut mm, BASE.as_u32(), NOT_PRESENT_WRITE).unwrap();
    fault(&mut mm, BASE.add_pages(1).as_u32(), NOT_PRESENT_WRITE).unwrap();

    let child = mm.clone_address_space(&parent).unwrap();
    mm.activate(&child);
    fault(&mut mm, BASE.as_u32(), PROTECTION_WRITE).unwrap();

    // Mid-flight the ledger balances: every missing frame is either a
    // counted user frame or resident in the heap.
    assert_eq!(
        baseline - mm.free_frames(),
        mm.referenced_frames() + mm.heap().stats().resident_pages
    );

    mm.activate_kernel_only();
    mm.destroy_address_space(child);
    mm.destroy_address_space(parent);
    mm.heap_free(heap_alloc.virt);

    assert_eq!(mm.free_frames(), baseline);
    assert_eq!(mm.referenced_frames(), 0);
    assert_eq!(mm.heap().stats().used_slots, 0);
    assert_eq!(mm.heap().stats().resident_pages, 0);
}
