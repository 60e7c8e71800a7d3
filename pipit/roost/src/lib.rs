//! Roost: the ground floor of the Pipit kernel.
//!
//! This crate holds everything the kernel core treats as an external
//! collaborator contract: address arithmetic, interrupt state, the raw
//! spinlock, console output, the boot-time physical memory map, and the
//! device contracts (teletype and block device). Architecture-privileged
//! instructions are confined to this crate behind `target_os = "none"`;
//! hosted builds get software fallbacks so the kernel's pure logic can be
//! exercised by ordinary unit tests.
#![no_std]

extern crate alloc;

#[macro_use]
pub mod kprint;

pub mod addressing;
pub mod boot;
pub mod dev;
pub mod interrupt;
pub mod spinlock;
pub mod x86_64;

/// Maximum number of CPUs the kernel is built for.
pub const MAX_CPU: usize = 8;

static NCPU: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(1);

/// Record the number of CPUs the boot path actually started.
pub fn set_ncpu(n: usize) {
    NCPU.store(n.clamp(1, MAX_CPU), core::sync::atomic::Ordering::SeqCst);
}

/// Number of online CPUs.
pub fn ncpu() -> usize {
    NCPU.load(core::sync::atomic::Ordering::SeqCst)
}
