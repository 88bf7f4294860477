//! TLB maintenance.
//!
//! Real invalidation only exists on the bare-metal x86 target; hosted
//! builds get no-ops so page-table logic stays testable. Callers
//! invalidate unconditionally and let the platform decide.

use crate::addresses::VirtAddr;

/// Invalidate the TLB entry for one page on this CPU (`invlpg`).
///
/// Required after any change to a present entry of the **active** address
/// space; changes to inactive spaces take effect on the next CR3 load.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
pub fn invalidate_tlb_page(va: VirtAddr) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
}

/// Hosted stand-in: nothing to invalidate.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
pub fn invalidate_tlb_page(va: VirtAddr) {
    let _ = va;
}

/// Flush the entire TLB by reloading CR3 (global pages survive).
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
pub fn flush_all_tlb() {
    unsafe {
        let cr3: u32;
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }
}

/// Hosted stand-in: nothing to flush.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
pub fn flush_all_tlb() {}
