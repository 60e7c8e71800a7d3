//! # Pipit: a small multicore teaching kernel core.
//!
//! Pipit is the machine-independent core of a small x86-64 operating system:
//! the physical page allocator, the per-CPU scheduler and wait queues, the
//! process/thread lifecycle, the disk buffer cache, and the `nestfs` on-disk
//! filesystem. Everything below it (boot, interrupt vectors, the actual
//! disk and console drivers) lives behind the contracts in the [`roost`]
//! crate.
//!
//! The crate is organized leaves-first:
//!
//! - [`mm`]: buddy allocator over the physical frame map, and the x86-64
//!   page table it hands frames to.
//! - [`sync`]: interrupt-safe spinlocks and wait queues with the
//!   predicate-wait protocol every blocking path uses.
//! - [`thread`]: tasks, per-CPU run queues, context switching, the timer
//!   wheel.
//! - [`proc`]: the process lifecycle from spawn to reap.
//! - [`vfs`]: files, file-descriptor tables, pipes.
//! - [`bufcache`]: the bounded disk block cache.
//! - [`nestfs`]: the on-disk filesystem.
//! - [`syscall`]: the system call boundary.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate roost;

pub mod bufcache;
mod lang;
pub mod mm;
pub mod nestfs;
pub mod proc;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod vfs;

pub use roost::MAX_CPU;

/// Errors a kernel operation can report.
///
/// Every error crosses the system call boundary as a small negative
/// integer; internal functions use the same convention so a failure
/// propagates unchanged from the point of detection to user space.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation not permitted. (EPERM)
    NotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// Interrupted by cancellation. (EINTR)
    Interrupted,
    /// I/O error. (EIO)
    Io,
    /// Argument list too long. (E2BIG)
    TooBig,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// Bad file descriptor. (EBADF)
    BadFileDescriptor,
    /// No child processes. (ECHILD)
    NoChild,
    /// Resource temporarily unavailable. (EAGAIN)
    WouldBlock,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Bad user address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExists,
    /// Not a directory. (ENOTDIR)
    NotDirectory,
    /// Is a directory. (EISDIR)
    IsDirectory,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files in system. (ENFILE)
    FileTableFull,
    /// Too many open files. (EMFILE)
    TooManyOpenFiles,
    /// Text file busy. (ETXTBSY)
    TextBusy,
    /// Illegal seek. (ESPIPE)
    IllegalSeek,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Broken pipe. (EPIPE)
    BrokenPipe,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
}

impl KernelError {
    /// Encode as the negative integer returned through the syscall boundary.
    pub const fn into_isize(self) -> isize {
        match self {
            KernelError::NotPermitted => -1,
            KernelError::NoSuchEntry => -2,
            KernelError::Interrupted => -4,
            KernelError::Io => -5,
            KernelError::TooBig => -7,
            KernelError::NoExec => -8,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoChild => -10,
            KernelError::WouldBlock => -11,
            KernelError::NoMemory => -12,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::FileExists => -17,
            KernelError::NotDirectory => -20,
            KernelError::IsDirectory => -21,
            KernelError::InvalidArgument => -22,
            KernelError::FileTableFull => -23,
            KernelError::TooManyOpenFiles => -24,
            KernelError::TextBusy => -26,
            KernelError::NoSpace => -28,
            KernelError::IllegalSeek => -29,
            KernelError::BrokenPipe => -32,
            KernelError::NoSuchSyscall => -38,
        }
    }
}

impl TryFrom<isize> for KernelError {
    type Error = isize;

    fn try_from(value: isize) -> Result<Self, isize> {
        match value {
            -1 => Ok(Self::NotPermitted),
            -2 => Ok(Self::NoSuchEntry),
            -4 => Ok(Self::Interrupted),
            -5 => Ok(Self::Io),
            -7 => Ok(Self::TooBig),
            -8 => Ok(Self::NoExec),
            -9 => Ok(Self::BadFileDescriptor),
            -10 => Ok(Self::NoChild),
            -11 => Ok(Self::WouldBlock),
            -12 => Ok(Self::NoMemory),
            -14 => Ok(Self::BadAddress),
            -16 => Ok(Self::Busy),
            -17 => Ok(Self::FileExists),
            -20 => Ok(Self::NotDirectory),
            -21 => Ok(Self::IsDirectory),
            -22 => Ok(Self::InvalidArgument),
            -23 => Ok(Self::FileTableFull),
            -24 => Ok(Self::TooManyOpenFiles),
            -26 => Ok(Self::TextBusy),
            -28 => Ok(Self::NoSpace),
            -29 => Ok(Self::IllegalSeek),
            -32 => Ok(Self::BrokenPipe),
            -38 => Ok(Self::NoSuchSyscall),
            e => Err(e),
        }
    }
}

/// The most negative value that is still an ordinary result.
///
/// Functions that return a block number in an unsigned word encode failures
/// as values at or above `MIN_ERROR as u32`; see
/// [`nestfs::blocknum_to_result`].
pub const MIN_ERROR: isize = -100;

/// Bring the core up on the bootstrap CPU and start the first process.
///
/// The boot path calls this after hardware setup, with the console sink,
/// the block device, and (optionally) the console MMIO frame already
/// registered in [`roost`] and the kernel page-table template recorded via
/// [`mm::page_table::register_kernel_template`]. Interrupt stubs must route
/// the timer to [`thread::scheduler::timer_interrupt`], page faults to
/// [`proc::page_fault`], and system calls to [`syscall::dispatch`].
///
/// # Safety
/// Must run exactly once, on the bootstrap CPU's aligned boot stack, with
/// the usable memory ranges in `regions` owned by the kernel.
pub unsafe fn startup(regions: &roost::boot::Regions, first_program: &str) -> ! {
    unsafe { mm::init_mm(regions) };
    vfs::init();
    if roost::dev::block_device().is_some() {
        if let Err(e) = bufcache::init() {
            warning!("startup: buffer cache unavailable: {:?}", e);
        }
    }
    proc::spawn(first_program).expect("failed to start the first process");
    unsafe { thread::scheduler::idle(roost::x86_64::cpu_id()) }
}

/// Per-CPU entry for application processors: enter the idle loop.
///
/// # Safety
/// Must be the last call on the AP's aligned boot stack.
pub unsafe fn startup_ap() -> ! {
    unsafe { thread::scheduler::idle(roost::x86_64::cpu_id()) }
}
