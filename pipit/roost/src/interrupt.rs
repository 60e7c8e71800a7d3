//! Interrupt state, the interrupt-disable guard, and the saved user frame.
//!
//! Holding any spinlock implies local interrupts are off; the per-CPU guard
//! depth below is what the scheduler consults to refuse to run while a lock
//! is held.

use crate::x86_64::cpu_id;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    use core::arch::asm;

    #[inline]
    pub fn enabled() -> bool {
        let rflags: usize;
        unsafe {
            asm!("pushfq", "pop {}", out(reg) rflags, options(preserves_flags));
        }
        rflags & 0x200 != 0
    }

    #[inline]
    pub unsafe fn disable() {
        unsafe { asm!("cli") };
    }

    #[inline]
    pub unsafe fn enable() {
        unsafe { asm!("sti") };
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    // Hosted stand-in: a software flag per emulated CPU. Unit tests run the
    // kernel's lock discipline against this instead of the real IF bit.
    use crate::x86_64::cpu_id;
    use core::sync::atomic::{AtomicBool, Ordering};

    const OFF: AtomicBool = AtomicBool::new(false);
    static DISABLED: [AtomicBool; crate::MAX_CPU] = [OFF; crate::MAX_CPU];

    #[inline]
    pub fn enabled() -> bool {
        !DISABLED[cpu_id()].load(Ordering::SeqCst)
    }

    #[inline]
    pub unsafe fn disable() {
        DISABLED[cpu_id()].store(true, Ordering::SeqCst);
    }

    #[inline]
    pub unsafe fn enable() {
        DISABLED[cpu_id()].store(false, Ordering::SeqCst);
    }
}

/// The local interrupt state of the current CPU.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Read the current CPU's interrupt state.
    #[inline]
    pub fn current() -> Self {
        if arch::enabled() {
            InterruptState::On
        } else {
            InterruptState::Off
        }
    }

    /// Disable local interrupts.
    ///
    /// # Safety
    /// The caller takes over interrupt-state bookkeeping; prefer
    /// [`InterruptGuard`].
    #[inline]
    pub unsafe fn disable() {
        unsafe { arch::disable() }
    }

    /// Enable local interrupts.
    ///
    /// # Safety
    /// Must not be called while any [`InterruptGuard`] is live on this CPU.
    #[inline]
    pub unsafe fn enable() {
        unsafe { arch::enable() }
    }
}

const ZERO: AtomicUsize = AtomicUsize::new(0);
static GUARD_DEPTH: [AtomicUsize; crate::MAX_CPU] = [ZERO; crate::MAX_CPU];

/// An RAII guard that disables local interrupts for its lifetime.
///
/// Guards nest; the saved state is restored when the guard drops, so guards
/// must be dropped in reverse order of creation. Every live guard counts
/// toward the CPU's guard depth, which the scheduler checks before
/// switching away.
pub struct InterruptGuard {
    state: InterruptState,
}

impl InterruptGuard {
    /// Save the current state and disable interrupts.
    pub fn new() -> Self {
        let state = InterruptState::current();
        unsafe { arch::disable() };
        GUARD_DEPTH[cpu_id()].fetch_add(1, Ordering::SeqCst);
        Self { state }
    }

    /// Whether the current CPU holds any live guard.
    #[inline]
    pub fn is_guarded() -> bool {
        GUARD_DEPTH[cpu_id()].load(Ordering::SeqCst) != 0
    }

    /// Number of live guards on the current CPU.
    #[inline]
    pub fn depth() -> usize {
        GUARD_DEPTH[cpu_id()].load(Ordering::SeqCst)
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        GUARD_DEPTH[cpu_id()].fetch_sub(1, Ordering::SeqCst);
        if self.state == InterruptState::On {
            unsafe { arch::enable() };
        }
    }
}

bitflags::bitflags! {
    /// Page-fault error code bits pushed by the CPU.
    pub struct PFErrorCode: usize {
        /// Fault on a present page (protection violation).
        const PRESENT = 1 << 0;
        /// Fault on a write access.
        const WRITE = 1 << 1;
        /// Fault taken in user mode.
        const USER = 1 << 2;
        /// Fault on an instruction fetch.
        const INSTRUCTION = 1 << 4;
    }
}

/// x86-64 general purpose registers, in the order the entry stubs push them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GeneralPurposeRegisters {
    /// R15 register.
    pub r15: usize,
    /// R14 register.
    pub r14: usize,
    /// R13 register.
    pub r13: usize,
    /// R12 register.
    pub r12: usize,
    /// R11 register.
    pub r11: usize,
    /// R10 register.
    pub r10: usize,
    /// R9 register.
    pub r9: usize,
    /// R8 register.
    pub r8: usize,
    /// RDI register.
    pub rdi: usize,
    /// RSI register.
    pub rsi: usize,
    /// RBP register.
    pub rbp: usize,
    /// RBX register.
    pub rbx: usize,
    /// RDX register.
    pub rdx: usize,
    /// RCX register.
    pub rcx: usize,
    /// RAX register.
    pub rax: usize,
}

/// The frame the CPU pushes on a ring transition.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct InterruptStackFrame {
    /// Saved instruction pointer.
    pub rip: usize,
    /// Saved code segment selector.
    pub cs: usize,
    /// Saved RFLAGS.
    pub rflags: usize,
    /// Saved stack pointer.
    pub rsp: usize,
    /// Saved stack segment selector.
    pub ss: usize,
}

/// User-mode code segment selector (ring 3).
pub const SEGSEL_USER_CODE: usize = 0x1b;
/// User-mode data segment selector (ring 3).
pub const SEGSEL_USER_DATA: usize = 0x23;

const RFLAGS_IF: usize = 0x200;

/// A task's saved register frame.
///
/// This is the register state restored when a task resumes user execution;
/// the system call ABI reads arguments from and writes the return value into
/// this frame.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Registers {
    /// General purpose registers.
    pub gprs: GeneralPurposeRegisters,
    /// Hardware error code (page faults), zero otherwise.
    pub error_code: usize,
    /// The ring-transition frame.
    pub frame: InterruptStackFrame,
}

impl Registers {
    /// Create a fresh user-mode frame with interrupts enabled.
    ///
    /// The entry point and stack pointer are zero; the loader fills them in.
    pub fn new() -> Self {
        Self {
            gprs: GeneralPurposeRegisters::default(),
            error_code: 0,
            frame: InterruptStackFrame {
                rip: 0,
                cs: SEGSEL_USER_CODE,
                rflags: RFLAGS_IF,
                rsp: 0,
                ss: SEGSEL_USER_DATA,
            },
        }
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers {
    /// Restore this frame and drop to user mode via `iretq`.
    ///
    /// # Safety
    /// The frame must describe a valid ring-3 context and the active page
    /// table must map its code and stack. Never returns; unreachable on
    /// hosted builds.
    pub unsafe fn launch(&self) -> ! {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!(
                "mov rsp, {0}",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop r11",
                "pop r10",
                "pop r9",
                "pop r8",
                "pop rdi",
                "pop rsi",
                "pop rbp",
                "pop rbx",
                "pop rdx",
                "pop rcx",
                "pop rax",
                "add rsp, 8",
                "iretq",
                in(reg) self as *const _ as usize,
                options(noreturn)
            );
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        unreachable!("user mode requires bare metal");
    }
}
