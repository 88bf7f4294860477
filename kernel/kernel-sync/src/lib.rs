//! # Kernel synchronization primitives
//!
//! A test-and-test-and-set [`SpinLock`] for per-object serialization and an
//! RAII [`IrqGuard`] for critical sections that must not be preempted by an
//! interrupt handler. On hosted builds (tests) the interrupt guard is a
//! no-op so the code using it stays testable off-target.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::IrqGuard;
pub use spin_lock::{SpinLock, SpinLockGuard};
