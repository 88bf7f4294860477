//! # Kernel Configuration and Boot Interface
//!
//! Authoritative source for the memory-layout constants of a 32-bit,
//! protected-mode kernel with flat two-level paging, plus the boot-time
//! memory-map handoff structures consumed by the physical frame allocator.
//!
//! ## Virtual Address Space Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  User executable mappings       │
//! 0x4000_0000 ├─────────────────────────────────┤ USER_DYNAMIC_BASE
//!             │  User dynamic area (mmap-like)  │
//! 0x8000_0000 ├─────────────────────────────────┤ KERNEL_SPACE_BASE
//!             │  Kernel heap window (256 MiB)   │
//! 0x9000_0000 ├─────────────────────────────────┤ KERNEL_HEAP_END
//!             │  (reserved kernel regions)      │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_IMAGE_BASE
//!             │  Kernel text, data, MMIO areas  │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The upper half of every page directory (entries covering addresses at or
//! above [`memory::KERNEL_SPACE_BASE`]) is populated identically in every
//! address space and never touched by per-process code; the lower half is
//! private to the owning process.
//!
//! All constants are `const` and cross-checked by compile-time assertions;
//! there is no runtime configuration.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
