//! # Page-Fault Handling
//!
//! The demand-paging / copy-on-write state machine. A page entry moves
//! through: absent → demand (DAI set) → present-RW / present-COW /
//! present-MMIO; the two interesting transitions are driven from here:
//!
//! - **Not-present fault** on a demand entry: attach a fresh zeroed
//!   frame, flip DAI off and PRESENT on, invalidate the TLB line; the
//!   hardware retries the instruction.
//! - **Write fault** on a present COW entry: with a share count of 1
//!   the frame is simply made writable again (no copy); otherwise the
//!   contents move to a fresh frame and the old one is unreferenced.
//!
//! The handler runs with interrupts already disabled by the trap entry
//! and never takes the address-space lock: it walks the *active*
//! directory frame through the mapper, exactly as the MMU does. On the
//! uniprocessor model this cannot race the locked mapping paths, which
//! also run with interrupts masked.
//!
//! Anything the state machine cannot resolve — no backing entry at all,
//! a write to a page that is neither writable nor COW, or frame
//! exhaustion mid-fault — is returned as [`FaultError`] after logging
//! the full register dump; the trap layer halts, as no per-process
//! signal delivery exists.

use crate::{AllocError, FrameOwner, MemoryManager, copy_frame, zero_frame};
use bitfield_struct::bitfield;
use kernel_info::memory::{KERNEL_HEAP_BASE, KERNEL_HEAP_END, KERNEL_SPACE_BASE};
use kernel_vmem::{PhysMapper, VirtAddr, get_directory, get_table, invalidate_tlb_page};

/// Register snapshot delivered by the trap entry, CR2 included.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    /// Hardware error code; see [`PageFaultCode`].
    pub error_code: u32,
    /// Faulting linear address.
    pub cr2: u32,
}

/// The page-fault error code pushed by the CPU.
#[bitfield(u32)]
pub struct PageFaultCode {
    /// Clear for a not-present fault, set for a protection violation.
    pub present: bool,
    /// The access was a write.
    pub write: bool,
    /// The access came from user mode.
    pub user: bool,
    /// A reserved bit was set in a paging structure.
    pub reserved_write: bool,
    #[bits(28)]
    __: u32,
}

/// How a fault was resolved.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultResolution {
    /// A demand entry received its frame.
    DemandPaged,
    /// Sole owner of a COW frame; made writable in place.
    CowPromoted,
    /// Shared COW frame; contents moved to a private copy.
    CowCopied,
    /// The entry was already present and valid — a stale TLB line.
    Spurious,
}

/// Unresolvable faults. Returned to the trap layer, which halts.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    #[error("access to unmapped memory")]
    NotMapped,
    #[error("write to a page that is neither writable nor copy-on-write")]
    AccessViolation,
    #[error("out of memory while resolving a fault: {0}")]
    Exhausted(#[from] AllocError),
}

impl<'m, M: PhysMapper> MemoryManager<'m, M> {
    /// Resolve the page fault described by `regs`.
    ///
    /// # Errors
    ///
    /// [`FaultError`] for faults the state machine cannot resolve; the
    /// register dump has already been logged when this returns `Err`.
    pub fn handle_page_fault(&mut self, regs: &Registers) -> Result<FaultResolution, FaultError> {
        self.count_fault();
        let code = PageFaultCode::from_bits(regs.error_code);
        let va = VirtAddr(regs.cr2);

        let result = self.resolve_fault(va, code);
        match &result {
            Ok(resolution) => log::trace!("page fault at {va} resolved: {resolution:?}"),
            Err(e) => {
                log::error!("unresolvable page fault: {e}");
                log_register_dump(regs, code);
            }
        }
        result
    }

    fn resolve_fault(
        &mut self,
        va: VirtAddr,
        code: PageFaultCode,
    ) -> Result<FaultResolution, FaultError> {
        let addr = va.as_u32();
        if (KERNEL_HEAP_BASE..KERNEL_HEAP_END).contains(&addr) {
            self.resolve_heap_fault(va, code)
        } else if addr < KERNEL_SPACE_BASE {
            self.resolve_user_fault(va, code)
        } else {
            // kernel image / fixed mappings never fault legitimately
            Err(FaultError::NotMapped)
        }
    }

    fn resolve_heap_fault(
        &mut self,
        va: VirtAddr,
        code: PageFaultCode,
    ) -> Result<FaultResolution, FaultError> {
        let Some(entry) = self.heap.entry_at(va) else {
            return Err(FaultError::NotMapped);
        };
        if code.present() {
            // the kernel heap never shares frames, so there is nothing a
            // protection fault here could mean but a bug
            return Err(FaultError::AccessViolation);
        }
        if entry.demand() {
            self.heap
                .commit_demand_entry(va, &mut self.frames, self.mapper)?;
            return Ok(FaultResolution::DemandPaged);
        }
        if entry.present() {
            invalidate_tlb_page(va.align_down());
            return Ok(FaultResolution::Spurious);
        }
        Err(FaultError::NotMapped)
    }

    fn resolve_user_fault(
        &mut self,
        va: VirtAddr,
        code: PageFaultCode,
    ) -> Result<FaultResolution, FaultError> {
        let Some(dir_frame) = self.active_directory() else {
            return Err(FaultError::NotMapped);
        };
        // Lock-free walk of the active directory, the same way the MMU
        // sees it.
        let dir = unsafe { get_directory(self.mapper, dir_frame.base()) };
        let pde = dir.entry_for(va);
        if !pde.present() {
            return Err(FaultError::NotMapped);
        }
        let table = unsafe { get_table(self.mapper, pde.frame().base()) };
        let entry = table.entry_for(va);

        if !code.present() {
            if entry.demand() {
                let frame = self.request_frame(FrameOwner::UserSpace)?;
                zero_frame(self.mapper, frame);
                table.set_entry_for(
                    va,
                    entry.with_demand(false).with_present(true).with_frame(frame),
                );
                invalidate_tlb_page(va.align_down());
                return Ok(FaultResolution::DemandPaged);
            }
            if entry.present() {
                invalidate_tlb_page(va.align_down());
                return Ok(FaultResolution::Spurious);
            }
            return Err(FaultError::NotMapped);
        }

        if code.write() && entry.present() && entry.copy_on_write() {
            debug_assert!(!entry.mmio());
            let shares = self.refcounts.count(entry.frame(), self.mapper);
            if shares <= 1 {
                // sole owner left: take the frame back, no copy
                table.set_entry_for(va, entry.with_writable(true).with_copy_on_write(false));
                invalidate_tlb_page(va.align_down());
                return Ok(FaultResolution::CowPromoted);
            }
            // Allocate the private copy before letting go of the shared
            // frame, so exhaustion leaves every mapping intact.
            let fresh = self.request_frame(FrameOwner::UserSpace)?;
            copy_frame(self.mapper, entry.frame(), fresh);
            self.drop_user_frame(entry.frame());
            table.set_entry_for(
                va,
                entry
                    .with_writable(true)
                    .with_copy_on_write(false)
                    .with_frame(fresh),
            );
            invalidate_tlb_page(va.align_down());
            return Ok(FaultResolution::CowCopied);
        }
        Err(FaultError::AccessViolation)
    }
}

fn log_register_dump(regs: &Registers, code: PageFaultCode) {
    log::error!(
        "  cr2={:#010x} eip={:#010x} error={:#x} (present={} write={} user={} reserved={})",
        regs.cr2,
        regs.eip,
        regs.error_code,
        u8::from(code.present()),
        u8::from(code.write()),
        u8::from(code.user()),
        u8::from(code.reserved_write()),
    );
    log::error!(
        "  eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
        regs.eax,
        regs.ebx,
        regs.ecx,
        regs.edx
    );
    log::error!(
        "  esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x} eflags={:#010x}",
        regs.esi,
        regs.edi,
        regs.ebp,
        regs.esp,
        regs.eflags
    );
}
