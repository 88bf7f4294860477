//! # User Address Spaces
//!
//! One [`AddressSpace`] per process: a page-directory page whose upper
//! half is the shared kernel template, up to 512 lazily created
//! page-table pages for the private lower half, and a bump hint for
//! "map anywhere" requests. Directory and tables are kernel-heap pages;
//! their contents live in physical frames and are edited through the
//! [`PhysMapper`], never through raw pointers into the tables.
//!
//! All mutating operations go through the owning [`MemoryManager`] with
//! interrupts masked and the space's spin lock held. The page-fault
//! handler is the one context that touches PTEs without the lock (see
//! `fault.rs`); that is sound on the uniprocessor model because every
//! locked path here also runs with interrupts disabled.
//!
//! Multi-page mapping is transactional. The fallible steps — creating
//! page tables and taking frame references — all happen before the
//! first entry is written, so a failure never leaves the range
//! half-mapped.

use crate::heap::HeapPage;
use crate::{AllocError, MemoryManager};
use kernel_info::memory::{KERNEL_SPACE_BASE, USER_DYNAMIC_BASE, USER_PAGE_TABLES};
use kernel_sync::{IrqGuard, SpinLock};
use kernel_vmem::page_table::ENTRY_COUNT;
use kernel_vmem::{
    FrameIndex, PageEntry, PhysMapper, VirtAddr, get_directory, get_table, invalidate_tlb_page,
};

/// Where a user mapping goes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapPlacement {
    /// First free range at or after the space's stored hint, wrapping
    /// around the user dynamic area. Advances the hint.
    Anywhere,
    /// Like `Anywhere`, but the search starts at the given address.
    Near(VirtAddr),
    /// Exactly at the given (page-aligned) address.
    Fixed(VirtAddr),
}

/// What to do when a fixed-placement page is already mapped.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClobberPolicy {
    /// Refuse the whole request.
    Fail,
    /// Discard the existing mapping. Dangerous.
    Overwrite,
    /// Leave the existing entry; its supplied frame (if any) stays with
    /// the caller.
    SkipExisting,
}

/// Recoverable mapping failures.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("page already mapped at {0}")]
    AlreadyMapped(VirtAddr),
    #[error("virtual range extends outside the user half")]
    OutOfRange,
    #[error("no free virtual range of {0} pages")]
    NoVirtualRange(usize),
    #[error("device mappings require caller-supplied frames")]
    MmioNeedsFrames,
}

/// A process's private view of the lower 2 GiB. Exclusively owned by
/// one process; activation is a borrow, never a transfer.
pub struct AddressSpace {
    inner: SpinLock<AspaceInner>,
}

struct AspaceInner {
    /// The page-directory page. Lower half private, upper half stamped
    /// from the kernel template at creation and never touched again.
    directory: HeapPage,
    /// Lazily created page-table pages, one per lower-half directory slot.
    tables: [Option<HeapPage>; USER_PAGE_TABLES],
    /// Next candidate address for `MapPlacement::Anywhere`.
    hint: VirtAddr,
    /// Logical owners of this space. Starts at 1 for the creator;
    /// teardown happens when the last owner lets go.
    shares: u32,
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("directory", &self.directory_frame())
            .finish_non_exhaustive()
    }
}

impl PartialEq for AddressSpace {
    fn eq(&self, other: &Self) -> bool {
        self.directory_frame() == other.directory_frame()
    }
}

impl AddressSpace {
    /// Frame of this space's page directory (what CR3 would hold).
    #[must_use]
    pub fn directory_frame(&self) -> FrameIndex {
        self.inner.lock().directory.frame
    }

    /// Register another logical owner (a second thread attaching to the
    /// process's space). Returns the new share count.
    pub fn reference(&self) -> u32 {
        let _irq = IrqGuard::new();
        let mut inner = self.inner.lock();
        inner.shares += 1;
        inner.shares
    }

    /// Current number of logical owners.
    #[must_use]
    pub fn share_count(&self) -> u32 {
        self.inner.lock().shares
    }
}

impl<'m, M: PhysMapper> MemoryManager<'m, M> {
    /// Create an empty address space: private half unmapped, kernel half
    /// shared with every other space via the boot template.
    ///
    /// # Errors
    ///
    /// Heap/frame exhaustion while allocating the directory page.
    pub fn create_address_space(&mut self) -> Result<AddressSpace, AllocError> {
        let _irq = IrqGuard::new();
        let directory = self.heap.allocate_page(&mut self.frames, self.mapper)?;

        // The directory frame comes back zeroed; only the kernel half
        // needs filling in.
        let dir = unsafe { get_directory(self.mapper, directory.frame.base()) };
        let template = unsafe { get_directory(self.mapper, self.kernel_template.base()) };
        dir.copy_range_from(template, USER_PAGE_TABLES..ENTRY_COUNT);

        Ok(AddressSpace {
            inner: SpinLock::new(AspaceInner {
                directory,
                tables: [const { None }; USER_PAGE_TABLES],
                hint: VirtAddr(USER_DYNAMIC_BASE),
                shares: 1,
            }),
        })
    }

    /// Map `pages` consecutive user pages.
    ///
    /// Each page is either backed by a caller-supplied frame (installed
    /// PRESENT and reference-counted, unless `mmio`) or, with `phys` of
    /// `None`, marked demand-allocate and given a frame on first touch.
    /// `clobber` only matters for [`MapPlacement::Fixed`]; searched
    /// placements only ever land on free ranges.
    ///
    /// On any failure the range is left exactly as it was: nothing this
    /// call mapped survives.
    ///
    /// # Errors
    ///
    /// [`MapError::AlreadyMapped`] under [`ClobberPolicy::Fail`],
    /// [`MapError::OutOfRange`] / [`MapError::NoVirtualRange`] for
    /// placement failures, and allocation errors from page-table or
    /// reference-count bookkeeping.
    ///
    /// # Panics
    ///
    /// If `pages` is zero or `phys` is present with the wrong length.
    #[allow(clippy::too_many_arguments)]
    pub fn map_user(
        &mut self,
        space: &AddressSpace,
        placement: MapPlacement,
        pages: usize,
        phys: Option<&[FrameIndex]>,
        read_write: bool,
        clobber: ClobberPolicy,
        mmio: bool,
    ) -> Result<VirtAddr, MapError> {
        assert!(pages > 0, "zero-page user mapping");
        if let Some(list) = phys {
            assert_eq!(list.len(), pages, "frame list does not match page count");
        } else if mmio {
            return Err(MapError::MmioNeedsFrames);
        }

        let _irq = IrqGuard::new();
        let mut inner = space.inner.lock();

        let base = match placement {
            MapPlacement::Fixed(addr) => {
                let addr = addr.align_down();
                Self::check_user_range(addr, pages)?;
                addr
            }
            MapPlacement::Anywhere => {
                let hint = inner.hint;
                self.find_user_range(&inner, hint, pages)?
            }
            MapPlacement::Near(hint) => self.find_user_range(&inner, hint.align_down(), pages)?,
        };

        // Phase 1: make sure every page table exists. Created tables are
        // ordinary bookkeeping and stay behind even if we fail later.
        for i in 0..pages {
            let va = base.add_pages(i as u32);
            self.ensure_table(&mut inner, va.directory_index())?;
        }

        // Phase 2: occupancy check under the Fail policy, before
        // anything is written.
        if clobber == ClobberPolicy::Fail {
            for i in 0..pages {
                let va = base.add_pages(i as u32);
                if !self.page_is_free(&inner, va) {
                    return Err(MapError::AlreadyMapped(va));
                }
            }
        }

        // Phase 3: take the reference counts for the frames that will
        // actually be installed. This is the last fallible step.
        if let Some(list) = phys {
            if !mmio {
                for i in 0..pages {
                    let va = base.add_pages(i as u32);
                    if clobber == ClobberPolicy::SkipExisting && !self.page_is_free(&inner, va) {
                        continue;
                    }
                    let referenced = self.refcounts.reference(
                        list[i],
                        &mut self.heap,
                        &mut self.frames,
                        self.mapper,
                    );
                    if let Err(e) = referenced {
                        for j in (0..i).rev() {
                            let va = base.add_pages(j as u32);
                            if clobber == ClobberPolicy::SkipExisting
                                && !self.page_is_free(&inner, va)
                            {
                                continue;
                            }
                            self.drop_user_frame(list[j]);
                        }
                        return Err(e.into());
                    }
                }
            }
        }

        // Phase 4: install. Infallible from here on.
        for i in 0..pages {
            let va = base.add_pages(i as u32);
            let table_frame = match inner.tables[va.directory_index()] {
                Some(page) => page.frame,
                // phase 1 created it
                None => continue,
            };
            let table = unsafe { get_table(self.mapper, table_frame.base()) };
            let existing = table.entry_for(va);
            if existing.is_occupied() {
                match clobber {
                    ClobberPolicy::SkipExisting => continue,
                    ClobberPolicy::Overwrite => {
                        if existing.is_counted() {
                            self.drop_user_frame(existing.frame());
                        }
                    }
                    // phase 2 ruled this out
                    ClobberPolicy::Fail => continue,
                }
            }
            table.set_entry_for(va, Self::build_entry(phys.map(|list| list[i]), read_write, mmio));
            invalidate_tlb_page(va);
        }

        if matches!(placement, MapPlacement::Anywhere) {
            let next = base.add_pages(pages as u32);
            inner.hint = if next.as_u32() >= KERNEL_SPACE_BASE || next.as_u32() == 0 {
                VirtAddr(USER_DYNAMIC_BASE)
            } else {
                next
            };
        }
        Ok(base)
    }

    /// Unmap `pages` user pages starting at `base`. Holes are fine:
    /// unmapping unmapped memory is not an error. Present non-MMIO
    /// entries unreference their frame, freeing it at count zero.
    ///
    /// # Errors
    ///
    /// [`MapError::OutOfRange`] when the range reaches the kernel half.
    pub fn unmap_user(
        &mut self,
        space: &AddressSpace,
        base: VirtAddr,
        pages: usize,
    ) -> Result<(), MapError> {
        let base = base.align_down();
        Self::check_user_range(base, pages)?;

        let _irq = IrqGuard::new();
        let mut inner = space.inner.lock();
        self.unmap_range(&mut inner, base, pages);
        Ok(())
    }

    /// Copy-on-write fork of `source`.
    ///
    /// Demand and MMIO entries are copied verbatim. Every present,
    /// counted entry is re-referenced and installed write-protected with
    /// COW set in **both** spaces — the source's TLB line is invalidated
    /// immediately, so a write through either side faults. A mid-clone
    /// allocation failure tears the partial clone down and leaves the
    /// source valid (already-flipped source entries stay COW, which is
    /// benign: their next write simply takes the single-owner fast path).
    ///
    /// # Errors
    ///
    /// Heap/frame exhaustion from directory, table or reference-count
    /// allocation.
    pub fn clone_address_space(&mut self, source: &AddressSpace) -> Result<AddressSpace, AllocError> {
        let clone = self.create_address_space()?;

        let _irq = IrqGuard::new();
        let mut src = source.inner.lock();
        let mut dst = clone.inner.lock();
        dst.hint = src.hint;

        let result = self.populate_clone(&mut src, &mut dst);
        drop(dst);
        drop(src);
        match result {
            Ok(()) => Ok(clone),
            Err(e) => {
                log::debug!("address space clone failed, tearing down partial copy ({e})");
                self.destroy_address_space(clone);
                Err(e)
            }
        }
    }

    /// Drop one logical owner of `space`, tearing it down when the last
    /// one is gone: every present non-MMIO frame is unreferenced (and
    /// freed at count zero); the page tables and the directory go back
    /// to the kernel heap. While owners remain the handle is returned
    /// untouched for them to keep using.
    ///
    /// # Panics
    ///
    /// If the final teardown hits the active space — the scheduler must
    /// switch away first; freeing the live directory is a kernel bug.
    pub fn destroy_address_space(&mut self, space: AddressSpace) -> Option<AddressSpace> {
        let _irq = IrqGuard::new();
        {
            let mut inner = space.inner.lock();
            inner.shares -= 1;
            if inner.shares > 0 {
                drop(inner);
                return Some(space);
            }
        }
        let inner = space.inner.into_inner();
        assert!(
            self.active_directory() != Some(inner.directory.frame),
            "destroy of the active address space"
        );

        for table_page in inner.tables.iter().flatten() {
            let table = unsafe { get_table(self.mapper, table_page.frame.base()) };
            for i in 0..ENTRY_COUNT {
                let entry = table.entry(i);
                if entry.is_counted() {
                    self.drop_user_frame(entry.frame());
                }
            }
            self.heap.free(table_page.virt, &mut self.frames);
        }
        self.heap.free(inner.directory.virt, &mut self.frames);
        None
    }

    /// Make `space` the one the MMU translates user addresses with.
    /// The manager records the directory frame; the space itself stays
    /// owned by its process.
    pub fn activate(&mut self, space: &AddressSpace) {
        let frame = space.directory_frame();
        self.set_active(Some(frame));
        Self::load_directory(frame);
    }

    /// Switch to the bare kernel template (no user half).
    pub fn activate_kernel_only(&mut self) {
        self.set_active(None);
        Self::load_directory(self.kernel_template_frame());
    }

    /// The entry currently governing `va` in `space`, if any table
    /// covers it. Introspection for collaborators and tests.
    #[must_use]
    pub fn user_entry(&self, space: &AddressSpace, va: VirtAddr) -> Option<PageEntry> {
        if va.as_u32() >= KERNEL_SPACE_BASE {
            return None;
        }
        let inner = space.inner.lock();
        let table_page = inner.tables[va.directory_index()]?;
        let table = unsafe { get_table(self.mapper, table_page.frame.base()) };
        Some(table.entry_for(va))
    }

    fn populate_clone(
        &mut self,
        src: &mut AspaceInner,
        dst: &mut AspaceInner,
    ) -> Result<(), AllocError> {
        for dir_index in 0..USER_PAGE_TABLES {
            let Some(src_page) = src.tables[dir_index] else {
                continue;
            };
            let dst_frame = self.ensure_table(dst, dir_index)?;
            let src_table = unsafe { get_table(self.mapper, src_page.frame.base()) };
            let dst_table = unsafe { get_table(self.mapper, dst_frame.base()) };

            for i in 0..ENTRY_COUNT {
                let entry = src_table.entry(i);
                if !entry.is_occupied() {
                    continue;
                }
                if entry.demand() || entry.mmio() {
                    dst_table.set_entry(i, entry);
                    continue;
                }
                self.refcounts
                    .reference(entry.frame(), &mut self.heap, &mut self.frames, self.mapper)?;
                let shared = entry.with_writable(false).with_copy_on_write(true);
                dst_table.set_entry(i, shared);
                src_table.set_entry(i, shared);
                // a stale writable translation would let the source
                // bypass the fault
                invalidate_tlb_page(Self::va_of(dir_index, i));
            }
        }
        Ok(())
    }

    fn unmap_range(&mut self, inner: &mut AspaceInner, base: VirtAddr, pages: usize) {
        for i in 0..pages {
            let va = base.add_pages(i as u32);
            let Some(table_page) = inner.tables[va.directory_index()] else {
                continue;
            };
            let table = unsafe { get_table(self.mapper, table_page.frame.base()) };
            let entry = table.entry_for(va);
            if !entry.is_occupied() {
                continue;
            }
            if entry.is_counted() {
                self.drop_user_frame(entry.frame());
            }
            table.set_entry_for(va, PageEntry::zero());
            invalidate_tlb_page(va);
        }
    }

    /// Get the page table covering directory slot `index`, creating it
    /// (zeroed, PDE installed PRESENT|RW|USER) on first use.
    fn ensure_table(
        &mut self,
        inner: &mut AspaceInner,
        index: usize,
    ) -> Result<FrameIndex, AllocError> {
        debug_assert!(index < USER_PAGE_TABLES);
        if let Some(page) = inner.tables[index] {
            return Ok(page.frame);
        }
        let page = self.heap.allocate_page(&mut self.frames, self.mapper)?;
        let dir = unsafe { get_directory(self.mapper, inner.directory.frame.base()) };
        dir.set_entry(
            index,
            PageEntry::new()
                .with_present(true)
                .with_writable(true)
                .with_user_access(true)
                .with_frame(page.frame),
        );
        inner.tables[index] = Some(page);
        Ok(page.frame)
    }

    fn page_is_free(&self, inner: &AspaceInner, va: VirtAddr) -> bool {
        match inner.tables[va.directory_index()] {
            None => true,
            Some(table_page) => {
                let table = unsafe { get_table(self.mapper, table_page.frame.base()) };
                !table.entry_for(va).is_occupied()
            }
        }
    }

    /// First free run of `pages` at or after `hint`, wrapping around the
    /// user dynamic area once.
    fn find_user_range(
        &self,
        inner: &AspaceInner,
        hint: VirtAddr,
        pages: usize,
    ) -> Result<VirtAddr, MapError> {
        let start = if (USER_DYNAMIC_BASE..KERNEL_SPACE_BASE).contains(&hint.as_u32()) {
            hint
        } else {
            VirtAddr(USER_DYNAMIC_BASE)
        };
        if let Some(va) = self.scan_window(inner, start.as_u32(), KERNEL_SPACE_BASE, pages) {
            return Ok(va);
        }
        if let Some(va) = self.scan_window(inner, USER_DYNAMIC_BASE, start.as_u32(), pages) {
            return Ok(va);
        }
        Err(MapError::NoVirtualRange(pages))
    }

    fn scan_window(
        &self,
        inner: &AspaceInner,
        start: u32,
        end: u32,
        pages: usize,
    ) -> Option<VirtAddr> {
        let span = (pages as u64) << 12;
        let end = u64::from(end);
        let mut va = u64::from(start);
        'candidate: while va + span <= end {
            for k in 0..pages {
                let page_va = VirtAddr((va + ((k as u64) << 12)) as u32);
                if !self.page_is_free(inner, page_va) {
                    va += ((k + 1) as u64) << 12;
                    continue 'candidate;
                }
            }
            return Some(VirtAddr(va as u32));
        }
        None
    }

    fn check_user_range(base: VirtAddr, pages: usize) -> Result<(), MapError> {
        let end = u64::from(base.as_u32()) + ((pages as u64) << 12);
        if end <= u64::from(KERNEL_SPACE_BASE) {
            Ok(())
        } else {
            Err(MapError::OutOfRange)
        }
    }

    fn build_entry(frame: Option<FrameIndex>, read_write: bool, mmio: bool) -> PageEntry {
        match frame {
            Some(frame) => PageEntry::new()
                .with_present(true)
                .with_writable(read_write)
                .with_user_access(true)
                .with_cache_disabled(mmio)
                .with_mmio(mmio)
                .with_frame(frame),
            None => PageEntry::new()
                .with_demand(true)
                .with_writable(read_write)
                .with_user_access(true),
        }
    }

    const fn va_of(dir_index: usize, entry_index: usize) -> VirtAddr {
        VirtAddr(((dir_index as u32) << 22) | ((entry_index as u32) << 12))
    }

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn load_directory(frame: FrameIndex) {
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) frame.base().as_u32(),
                options(nostack, preserves_flags)
            );
        }
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn load_directory(_frame: FrameIndex) {}
}
