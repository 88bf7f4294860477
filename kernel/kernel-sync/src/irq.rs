//! Interrupt masking.
//!
//! Page-table mutation must not race the page-fault path of the same CPU,
//! so every mutating memory-manager entry point holds an [`IrqGuard`] for
//! its duration. The guard is a no-op on hosted builds; `cli`/`sti` only
//! exist on the bare-metal x86 target.

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted. Typically used
/// to restore a previously disabled interrupt state.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `EFLAGS` value (via `pushfd/pop`).
///
/// Bit 9 (`IF`) indicates whether interrupts are enabled.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
#[must_use]
pub fn eflags() -> u32 {
    let r: u32;
    unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit (bit 9 of `EFLAGS`). If
/// interrupts were enabled, it executes `cli`. On drop, it executes `sti`
/// **only** if they were previously enabled, preserving the original state.
/// Guards therefore nest correctly.
///
/// # Platform / Privilege
///
/// On `x86` bare metal this requires a privileged context permitting
/// `cli/sti`. Everywhere else (host test builds) the guard does nothing.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = (eflags() & (1 << 9)) != 0;
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Hosted stand-in: nothing to mask.
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
