//! Tasks and context switching.
//!
//! A [`Task`] is a single scheduling entity: an owned, aligned kernel
//! stack, the saved stack pointer used by the context switch, the saved
//! user register frame, and the task's share of its group's resources. The
//! execution context moves by ownership: a run queue or a wait queue holds
//! the `Box<Task>` of every task that is not currently running, while the
//! [`TaskRecord`] stays behind in the task table so that `waitpid`, wakes,
//! and cancellation can observe a task that is off running somewhere else.
//!
//! The lifecycle is `Blank → Runnable ↔ Blocked → Broken → reaped`;
//! `Running` and `Idle` are scheduler-internal refinements of `Runnable`.

pub mod clock;
pub mod scheduler;

use crate::proc::{NTASK, Process};
use crate::sync::{SpinLock, WaitQueue};
use alloc::{boxed::Box, sync::Arc};
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use roost::interrupt::{InterruptGuard, InterruptState, Registers};
use roost::x86_64::cpu_id;

/// Size of each task's kernel stack.
pub const STACK_SIZE: usize = 0x20000;
/// Magic stored at the stack base to detect overflow.
pub const TASK_MAGIC: usize = 0xdead_beef_cafe_babe;

/// Wait queue for parents blocked in `waitpid` and for group exits waiting
/// on their sibling threads.
pub static WAITPID_WQ: WaitQueue = WaitQueue::new();

/// The task stack. The task pointer and overflow magic live at the lowest
/// addresses; the usable stack grows down from the top.
#[repr(C, align(0x20000))]
pub(crate) struct TaskStack {
    task: *mut Task,
    magic: usize,
    _pad: [u8; STACK_SIZE - 2 * core::mem::size_of::<usize>()],
    _usable_marker: [u8; 0],
    _pin: core::marker::PhantomPinned,
}

/// A possible state of a task.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum TaskState {
    /// Slot allocated, not yet initialized.
    Blank,
    /// Ready to run, sitting on some run queue.
    Runnable,
    /// Executing on a CPU right now.
    Running,
    /// Parked on a wait queue.
    Blocked,
    /// Exited; waiting to be reaped.
    Broken,
    /// A CPU's idle task.
    Idle,
}

/// The table-resident half of a task.
///
/// Shared between the task itself, its parent, and anyone who needs to
/// wake or cancel it. The execution context ([`Task`]) holds one reference;
/// the task table holds another until the task is reaped.
pub struct TaskRecord {
    /// Task id: the task-table slot index.
    pub tid: usize,
    /// The process group this task belongs to.
    pub group_id: usize,
    /// Parent task id. Rewritten on re-parenting, under the task-table lock.
    pub parent: AtomicUsize,
    /// Lifecycle state.
    pub state: SpinLock<TaskState>,
    /// Exit status, valid once the task is Broken.
    pub exit_status: AtomicIsize,
    /// Group-exit cancellation flag, observed at predicate-wait points.
    pub exiting: AtomicBool,
    /// Wake-with-interrupt flag, observed by `msleep`.
    pub interrupted: AtomicBool,
    /// Home CPU for wakes and requeues.
    pub affinity: AtomicUsize,
    /// CPU currently executing this task, or -1.
    pub running_on: AtomicIsize,
    /// Whether the task is linked into some run queue.
    pub queued: AtomicBool,
    /// Child group leaders, owned in the forward direction only; the child
    /// points back with `parent`. Take the task-table lock first.
    pub children: SpinLock<ArrayVec<usize, NTASK>>,
    /// The record's share of the group resources, released at reap.
    pub resources: SpinLock<Option<Process>>,
}

impl TaskRecord {
    pub(crate) fn new(tid: usize, group_id: usize, parent: usize) -> Arc<Self> {
        Arc::new(Self {
            tid,
            group_id,
            parent: AtomicUsize::new(parent),
            state: SpinLock::new(TaskState::Blank),
            exit_status: AtomicIsize::new(0),
            exiting: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            affinity: AtomicUsize::new(tid % roost::ncpu()),
            running_on: AtomicIsize::new(-1),
            queued: AtomicBool::new(false),
            children: SpinLock::new(ArrayVec::new_const()),
            resources: SpinLock::new(None),
        })
    }

    /// The current lifecycle state.
    pub fn state(&self) -> TaskState {
        let guard = self.state.lock();
        let state = *guard;
        guard.unlock();
        state
    }

    /// Overwrite the lifecycle state.
    pub fn set_state(&self, state: TaskState) {
        let mut guard = self.state.lock();
        *guard = state;
        guard.unlock();
    }

    /// Whether a group exit has cancelled this task.
    #[inline]
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }
}

/// A task's execution context.
///
/// `sp` must stay the first field: the context-switch trampoline receives
/// `&mut task.sp` and relies on it being the task pointer itself.
#[repr(C)]
pub struct Task {
    pub(crate) sp: usize,
    stack: Box<TaskStack>,
    /// The shared, table-resident half.
    pub record: Arc<TaskRecord>,
    /// Saved user register frame.
    pub regs: Registers,
    /// The task's share of its group's resources. `None` for kernel-only
    /// tasks such as idle.
    pub process: Option<Process>,
    canary: usize,
}

const CANARY: usize = 0x50495049_54504950;

impl Task {
    /// Allocate an execution context for `record`.
    pub(crate) fn new(record: Arc<TaskRecord>) -> Box<Self> {
        let mut stack: Box<TaskStack> = unsafe { Box::new_uninit().assume_init() };
        stack.magic = TASK_MAGIC;
        let mut task = Box::new(Self {
            sp: 0,
            stack,
            record,
            regs: Registers::new(),
            process: None,
            canary: CANARY,
        });
        task.stack.task = task.as_mut() as *mut _;
        task
    }

    /// Build the initial context-switch frame so that the first switch into
    /// this task lands in `entry` with interrupts enabled.
    pub(crate) fn prepare(&mut self, entry: fn()) {
        let frame = unsafe {
            ((&mut self.stack._usable_marker as *mut _ as usize
                - core::mem::size_of::<ContextSwitchFrame>())
                as *mut ContextSwitchFrame)
                .as_mut()
                .unwrap()
        };
        *frame = ContextSwitchFrame {
            _r15: 0,
            _r14: 0,
            _r13: 0,
            _r12: 0,
            _bx: 0,
            _bp: 0,
            ret_addr: task_start as usize,
            entry: entry as usize,
            end_of_stack: 0,
        };
        self.sp = frame as *mut _ as usize;
        self.stack.task = self as *mut _;
    }

    pub(crate) unsafe fn do_run(&mut self) {
        unsafe {
            let _irq = InterruptGuard::new();
            let switch = with_current(|cur| cur as *const _ as usize != self as *const _ as usize);
            if switch {
                // Wait until the target has fully switched off its old CPU.
                while self.record.running_on.load(Ordering::SeqCst) != -1 {
                    core::hint::spin_loop();
                }
                let next_sp = self.sp;
                let current_sp = with_current(|cur| &mut cur.sp as *mut usize);
                context_switch_trampoline(current_sp, next_sp);
            }
        }
    }

    /// Switch this CPU to the task, consuming the owner. The previous task
    /// is disposed of by [`finish_context_switch`] according to its state.
    pub(crate) fn run(self: Box<Self>) {
        unsafe { Box::into_raw(self).as_mut().unwrap().do_run() }
    }
}

// Context switch machinery.

/// Mimics the stack a parked task would have: the six callee-saved
/// registers the trampoline pops, then the first-run entry thunk.
#[repr(C)]
struct ContextSwitchFrame {
    _r15: usize,
    _r14: usize,
    _r13: usize,
    _r12: usize,
    _bx: usize,
    _bp: usize,
    ret_addr: usize,
    entry: usize,
    end_of_stack: usize,
}

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn context_switch_trampoline(_current_sp: *mut usize, _next_sp: usize) {
    // RDI holds &current.sp, which is also the current task pointer; it
    // survives the register pops and becomes finish_context_switch's
    // argument.
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov r8, rsp",
        "mov [rdi], r8",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "jmp {}",
        sym finish_context_switch
    );
}

#[cfg(not(target_arch = "x86_64"))]
unsafe extern "C" fn context_switch_trampoline(_current_sp: *mut usize, _next_sp: usize) {
    unreachable!("context switching requires x86-64");
}

/// First code of a freshly created task: fetch the entry function the
/// frame parked above the return address, enable interrupts, and go.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn task_start() -> ! {
    core::arch::naked_asm!("pop rdi", "sti", "jmp {}", sym task_start_thunk);
}

#[cfg(not(target_arch = "x86_64"))]
unsafe extern "C" fn task_start() -> ! {
    unreachable!("context switching requires x86-64");
}

extern "C" fn task_start_thunk(entry: usize) -> ! {
    let entry: fn() = unsafe { core::mem::transmute(entry) };
    entry();
    exit_broken();
}

/// Runs on the incoming task's stack immediately after the switch;
/// disposes of the outgoing task according to its state.
unsafe extern "C" fn finish_context_switch(prev: &'static mut Task) {
    assert_eq!(InterruptState::current(), InterruptState::Off);
    assert_eq!(prev.canary, CANARY, "task struct corrupted");

    let prev_record = prev.record.clone();
    let prev_state = prev_record.state();
    let disposed = match prev_state {
        TaskState::Broken => {
            // The context will never run again; the record stays in the
            // task table until the parent reaps it.
            Some(unsafe { Box::from_raw(prev as *mut Task) })
        }
        TaskState::Running => {
            prev.record.set_state(TaskState::Runnable);
            let task = unsafe { Box::from_raw(prev as *mut Task) };
            scheduler::enqueue_on(cpu_id(), task);
            None
        }
        // A blocked task's owner is the wait queue it parked on; an idle
        // task is owned by its CPU.
        TaskState::Blocked | TaskState::Idle => None,
        TaskState::Runnable | TaskState::Blank => {
            unreachable!("switched away from a {:?} task", prev_state)
        }
    };

    with_current(|task| {
        {
            let mut state = task.record.state.lock();
            if *state != TaskState::Idle {
                *state = TaskState::Running;
            }
            state.unlock();
        }
        task.record
            .running_on
            .store(cpu_id() as isize, Ordering::SeqCst);

        // Activate the task's address space, or the boot table for kernel
        // tasks.
        let cr3 = match task.process.as_ref() {
            Some(p) => Some(p.address_space.pa()),
            None => crate::mm::page_table::kernel_template(),
        };
        if let Some(pa) = cr3 {
            unsafe { roost::x86_64::Cr3(pa.into_usize()).apply() };
        }
    });
    drop(disposed);
    prev_record.running_on.store(-1, Ordering::SeqCst);

    // A sibling may have started a group exit while we were off-CPU.
    if let Some(record) = current_record() {
        if record.is_exiting() && record.state() != TaskState::Broken {
            exit_broken();
        }
    }
}

// Current-task access.

#[cfg(not(test))]
#[inline]
fn current_task_ptr() -> Option<*mut Task> {
    let mut sp: usize;
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) sp);
    }
    let stack = (sp & !(STACK_SIZE - 1)) as *mut TaskStack;
    unsafe {
        if let Some(stack) = stack.as_mut() {
            if stack.magic == TASK_MAGIC {
                return Some(stack.task);
            }
        }
        None
    }
}

// Host test builds run on foreign stacks; there is never a current task.
#[cfg(test)]
#[inline]
fn current_task_ptr() -> Option<*mut Task> {
    None
}

#[inline]
pub(crate) fn try_with_current<R>(f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    current_task_ptr().map(|ptr| f(unsafe { ptr.as_mut().unwrap() }))
}

/// Run `f` with the current task. Panics when called from a context that
/// has no task, which also catches kernel stack overflows (the magic word
/// at the stack base is gone).
#[inline]
pub fn with_current<R>(f: impl FnOnce(&mut Task) -> R) -> R {
    try_with_current(f).expect("no current task (or kernel stack overflow)")
}

/// The record of the current task, if any.
pub fn current_record() -> Option<Arc<TaskRecord>> {
    try_with_current(|t| t.record.clone())
}

/// A handle to a parked task, owned by the wait queue it blocks on.
pub struct ParkHandle {
    pub(crate) task: Box<Task>,
}

unsafe impl Send for ParkHandle {}
unsafe impl Sync for ParkHandle {}

impl ParkHandle {
    /// Mark the task Runnable and hand it back to its home CPU's queue.
    pub fn unpark(self) {
        // Wait until the context switch away from the task is complete.
        while self.task.record.running_on.load(Ordering::SeqCst) != -1 {
            core::hint::spin_loop();
        }
        self.task.record.set_state(TaskState::Runnable);
        scheduler::enqueue(self.task);
    }

    /// The parked task's record.
    pub fn record(&self) -> &Arc<TaskRecord> {
        &self.task.record
    }
}

/// The opaque handle naming the running task on this CPU.
pub struct Current {
    _p: (),
}

impl Current {
    /// Mark the current task Blocked, hand its ownership to `f` as a
    /// [`ParkHandle`], then yield. The task resumes only after someone
    /// calls [`ParkHandle::unpark`].
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        with_current(|task| {
            task.record.set_state(TaskState::Blocked);
            let handle = ParkHandle {
                task: unsafe { Box::from_raw(task as *mut Task) },
            };
            f(handle);
        });
        assert!(
            !InterruptGuard::is_guarded(),
            "tried to block while holding a spinlock"
        );
        scheduler::reschedule();
    }

    /// The current task's id.
    pub fn tid() -> usize {
        with_current(|t| t.record.tid)
    }
}

/// Cooperatively yield the CPU.
pub fn yield_now() {
    scheduler::reschedule();
}

/// Terminate the current task from a cancellation point: mark it Broken,
/// wake anyone in `waitpid`, and never run it again.
pub fn exit_broken() -> ! {
    with_current(|task| {
        task.record.set_state(TaskState::Broken);
    });
    WAITPID_WQ.wake_all();
    loop {
        scheduler::reschedule();
    }
}
