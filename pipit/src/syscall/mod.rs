//! The system call boundary.
//!
//! Arguments follow a fixed register convention: the call number in `rax`,
//! arguments in `rdi`, `rsi`, `rdx`, `r10`, and the result back in `rax`
//! as a signed integer where negative values are [`KernelError`] codes.
//! `waitpid` additionally writes the exit status to `rcx`.

pub mod uaccess;

use crate::proc::{self, Process};
use crate::thread::{self, clock, with_current};
use crate::vfs::{self, Whence};
use crate::{bufcache, nestfs, KernelError};
use alloc::{string::String, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use num_enum::TryFromPrimitive;
use roost::addressing::{PAGE_MASK, Va};
use roost::interrupt::Registers;

/// System call numbers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    /// Current group id.
    GetPid = 1,
    /// Current task id.
    GetTid = 2,
    /// Parent group id.
    GetPpid = 3,
    /// Cooperative yield.
    Yield = 4,
    /// Spin briefly with interrupts enabled.
    Pause = 5,
    /// Map a fresh page at the given address.
    PageAlloc = 6,
    /// Duplicate the process.
    Fork = 7,
    /// Create a thread in the same group.
    Clone = 8,
    /// Group exit.
    Exit = 9,
    /// Thread exit; the last thread turns it into a group exit.
    Texit = 10,
    /// Reap an exited child.
    Waitpid = 11,
    /// Sleep in milliseconds.
    Msleep = 12,
    /// Open a root-directory file.
    Open = 13,
    /// Close a descriptor.
    Close = 14,
    /// Replace one descriptor with another.
    Dup2 = 15,
    /// Read from a descriptor.
    Read = 16,
    /// Write to a descriptor.
    Write = 17,
    /// Reposition a regular file's offset.
    Lseek = 18,
    /// Create a pipe; returns both descriptors packed.
    Pipe = 19,
    /// Replace the current image.
    Execv = 20,
    /// Read from a root-directory file by name.
    ReadDiskFile = 21,
    /// Flush (and optionally drop) the buffer cache.
    Sync = 22,
    /// Map the console MMIO page.
    MapConsole = 23,
    /// Select the display mode.
    Kdisplay = 24,
}

/// Open for reading.
pub const OF_READ: usize = 1;
/// Open for writing.
pub const OF_WRITE: usize = 2;
/// Create the file if it does not exist.
pub const OF_CREATE: usize = 4;
/// Truncate an existing file on open.
pub const OF_TRUNC: usize = 8;

// The kdisplay mode selector; the viewer itself lives outside the core.
static KDISPLAY: AtomicUsize = AtomicUsize::new(0);

/// Pack a pipe's descriptors into one return value.
fn pack_pipe_fds(rfd: usize, wfd: usize) -> usize {
    rfd | (wfd << 32)
}

struct SyscallAbi {
    sysno: usize,
    arg1: usize,
    arg2: usize,
    arg3: usize,
    arg4: usize,
}

impl SyscallAbi {
    fn from_registers(regs: &Registers) -> Self {
        Self {
            sysno: regs.gprs.rax,
            arg1: regs.gprs.rdi,
            arg2: regs.gprs.rsi,
            arg3: regs.gprs.rdx,
            arg4: regs.gprs.r10,
        }
    }
}

fn current_process() -> Process {
    with_current(|task| task.process.clone().expect("syscall from a kernel task"))
}

/// Handle the system call recorded in `regs`, writing the return value
/// back into `rax`. Called by the trap path with the current task's saved
/// frame.
pub fn dispatch(regs: &mut Registers) {
    let abi = SyscallAbi::from_registers(regs);
    let number = match SyscallNumber::try_from(abi.sysno) {
        Ok(n) => n,
        Err(_) => {
            regs.gprs.rax = KernelError::NoSuchSyscall.into_isize() as usize;
            return;
        }
    };

    // `exec` replaces the frame wholesale; everything else writes `rax`.
    if number == SyscallNumber::Execv {
        match sys_execv(&abi) {
            Ok(()) => {}
            Err(e) => regs.gprs.rax = e.into_isize() as usize,
        }
        return;
    }

    let r: Result<usize, KernelError> = match number {
        SyscallNumber::GetPid => Ok(current_process().group_id),
        SyscallNumber::GetTid => Ok(thread::Current::tid()),
        SyscallNumber::GetPpid => sys_getppid(),
        SyscallNumber::Yield => {
            thread::yield_now();
            Ok(0)
        }
        SyscallNumber::Pause => {
            for _ in 0..1_000_000 {
                roost::x86_64::pause();
            }
            Ok(0)
        }
        SyscallNumber::PageAlloc => sys_page_alloc(abi.arg1),
        SyscallNumber::Fork => proc::fork(),
        SyscallNumber::Clone => proc::clone_thread(),
        SyscallNumber::Exit => proc::exit(abi.arg1 as isize),
        SyscallNumber::Texit => proc::texit(abi.arg1 as isize),
        SyscallNumber::Waitpid => proc::waitpid(abi.arg1, abi.arg2).map(|(tid, status)| {
            regs.gprs.rcx = status as usize;
            tid
        }),
        SyscallNumber::Msleep => clock::msleep(abi.arg1 as u64).map(|_| 0),
        SyscallNumber::Open => sys_open(&abi),
        SyscallNumber::Close => current_process().fdtable.close(abi.arg1).map(|_| 0),
        SyscallNumber::Dup2 => current_process().fdtable.dup2(abi.arg1, abi.arg2),
        SyscallNumber::Read => sys_read(&abi),
        SyscallNumber::Write => sys_write(&abi),
        SyscallNumber::Lseek => sys_lseek(&abi),
        SyscallNumber::Pipe => sys_pipe(),
        SyscallNumber::Execv => unreachable!(),
        SyscallNumber::ReadDiskFile => sys_readdiskfile(&abi),
        SyscallNumber::Sync => bufcache::sync(abi.arg1 != 0).map(|_| 0),
        SyscallNumber::MapConsole => sys_map_console(abi.arg1),
        SyscallNumber::Kdisplay => {
            KDISPLAY.store(abi.arg1, Ordering::SeqCst);
            Ok(0)
        }
    };

    regs.gprs.rax = match r {
        Ok(v) => v,
        Err(e) => e.into_isize() as usize,
    };
}

fn sys_getppid() -> Result<usize, KernelError> {
    let record = thread::current_record().ok_or(KernelError::NotPermitted)?;
    let parent = record.parent.load(Ordering::SeqCst);
    Ok(proc::find_record(parent).map(|r| r.group_id).unwrap_or(parent))
}

fn sys_page_alloc(addr: usize) -> Result<usize, KernelError> {
    if addr & PAGE_MASK != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let va = Va::new(addr).ok_or(KernelError::InvalidArgument)?;
    if !va.is_user() {
        return Err(KernelError::InvalidArgument);
    }
    let page = crate::mm::Page::new().ok_or(KernelError::NoMemory)?;
    let process = current_process();
    let mut table = process.address_space.table.lock();
    let r = table.map_page(
        va,
        page,
        crate::mm::page_table::Permission::READ
            | crate::mm::page_table::Permission::WRITE
            | crate::mm::page_table::Permission::USER,
    );
    table.unlock();
    r.map(|_| 0)
}

fn sys_map_console(addr: usize) -> Result<usize, KernelError> {
    if addr & PAGE_MASK != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let va = Va::new(addr).ok_or(KernelError::InvalidArgument)?;
    if !va.is_user() {
        return Err(KernelError::InvalidArgument);
    }
    let pa = proc::console_mmio().ok_or(KernelError::NoSuchEntry)?;
    let process = current_process();
    let mut table = process.address_space.table.lock();
    let r = table.map_raw(
        va,
        pa,
        crate::mm::page_table::Permission::READ
            | crate::mm::page_table::Permission::WRITE
            | crate::mm::page_table::Permission::USER,
    );
    table.unlock();
    r.map(|_| 0)
}

fn sys_open(abi: &SyscallAbi) -> Result<usize, KernelError> {
    let process = current_process();
    let path = uaccess::read_user_cstr(&process.address_space, abi.arg1)?;
    let flags = abi.arg2;
    let readable = flags & OF_READ != 0;
    let writeable = flags & OF_WRITE != 0;
    if !readable && !writeable {
        return Err(KernelError::InvalidArgument);
    }
    let file = nestfs::open_file(
        &path,
        readable,
        writeable,
        flags & OF_CREATE != 0,
        flags & OF_TRUNC != 0,
    )?;
    process.fdtable.install(file)
}

// Bounce buffer ceiling for a single read/write slice.
const IO_CHUNK: usize = 0x10000;

fn sys_read(abi: &SyscallAbi) -> Result<usize, KernelError> {
    let process = current_process();
    let file = process.fdtable.get(abi.arg1)?;
    let len = abi.arg3.min(IO_CHUNK);
    let mut bounce = alloc::vec![0u8; len];
    let n = file.read(&mut bounce)?;
    uaccess::copy_to_user(&process.address_space, abi.arg2, &bounce[..n])?;
    Ok(n)
}

fn sys_write(abi: &SyscallAbi) -> Result<usize, KernelError> {
    let process = current_process();
    let file = process.fdtable.get(abi.arg1)?;
    let len = abi.arg3.min(IO_CHUNK);
    let mut bounce = alloc::vec![0u8; len];
    uaccess::copy_from_user(&process.address_space, abi.arg2, &mut bounce)?;
    file.write(&bounce)
}

fn sys_lseek(abi: &SyscallAbi) -> Result<usize, KernelError> {
    let process = current_process();
    let file = process.fdtable.get(abi.arg1)?;
    let whence = Whence::try_from(abi.arg3).map_err(|_| KernelError::InvalidArgument)?;
    file.seek(abi.arg2 as isize, whence)
}

fn sys_pipe() -> Result<usize, KernelError> {
    let process = current_process();
    let (reader, writer) = vfs::pipe::make_pipe();
    let rfd = process.fdtable.install(reader)?;
    let wfd = match process.fdtable.install(writer) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = process.fdtable.close(rfd);
            return Err(e);
        }
    };
    Ok(pack_pipe_fds(rfd, wfd))
}

fn sys_execv(abi: &SyscallAbi) -> Result<(), KernelError> {
    let process = current_process();
    let path = uaccess::read_user_cstr(&process.address_space, abi.arg1)?;
    let argv: Vec<String> = uaccess::read_user_argv(&process.address_space, abi.arg2)?;
    let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
    proc::exec(&path, &argv_refs)
}

fn sys_readdiskfile(abi: &SyscallAbi) -> Result<usize, KernelError> {
    let process = current_process();
    let path = uaccess::read_user_cstr(&process.address_space, abi.arg1)?;
    let len = abi.arg3.min(IO_CHUNK);
    let mut bounce = alloc::vec![0u8; len];
    let n = nestfs::read_file_data(&path, &mut bounce, abi.arg4)?;
    uaccess::copy_to_user(&process.address_space, abi.arg2, &bounce[..n])?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_round_trip() {
        for n in 1..=24usize {
            let number = SyscallNumber::try_from(n).unwrap();
            assert_eq!(number as usize, n);
        }
        assert!(SyscallNumber::try_from(0usize).is_err());
        assert!(SyscallNumber::try_from(25usize).is_err());
    }

    #[test]
    fn pipe_descriptor_packing() {
        let packed = pack_pipe_fds(3, 4);
        assert_eq!(packed & 0xffff_ffff, 3);
        assert_eq!(packed >> 32, 4);
    }

    #[test]
    fn unknown_syscalls_report_nosys() {
        // Dispatch must reject an unknown number before consulting the
        // current task.
        let mut regs = Registers::new();
        regs.gprs.rax = 999;
        dispatch(&mut regs);
        assert_eq!(
            regs.gprs.rax as isize,
            KernelError::NoSuchSyscall.into_isize()
        );
    }
}
