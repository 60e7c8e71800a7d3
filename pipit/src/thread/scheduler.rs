//! The per-CPU scheduler.
//!
//! Each CPU owns a FIFO run queue of tasks that are Runnable but not
//! executing. A task is enqueued on its home CPU (`tid % MAX_CPU` at
//! creation); cross-CPU wakes simply take the target CPU's queue lock.
//! When a CPU has nothing to run it falls back to its idle task, which
//! halt-loops until the next interrupt.

use super::{Task, TaskState};
use crate::sync::SpinLock;
use alloc::{boxed::Box, collections::VecDeque};
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;
use roost::interrupt::{InterruptGuard, InterruptState};
use roost::x86_64::{cpu_id, halt};
use roost::MAX_CPU;

struct PerCpu {
    queue: SpinLock<VecDeque<Box<Task>>>,
}

static RUNQ: [CachePadded<PerCpu>; MAX_CPU] = [const {
    CachePadded::new(PerCpu {
        queue: SpinLock::new(VecDeque::new()),
    })
}; MAX_CPU];

// Leaked pointers to each CPU's idle task, installed by `idle`.
static IDLE: [AtomicUsize; MAX_CPU] = [const { AtomicUsize::new(0) }; MAX_CPU];

unsafe impl Send for Task {}
unsafe impl Sync for Task {}

/// Enqueue `task` on its home CPU.
pub fn enqueue(task: Box<Task>) {
    let cpu = task.record.affinity.load(Ordering::SeqCst) % MAX_CPU;
    enqueue_on(cpu, task);
}

/// Enqueue `task` on `cpu`'s run queue.
///
/// The task must not already be linked into a run queue or executing; both
/// are excluded structurally (the caller owns the `Box`), and the `queued`
/// flag catches ownership bugs in debug builds.
pub fn enqueue_on(cpu: usize, task: Box<Task>) {
    let was_queued = task.record.queued.swap(true, Ordering::SeqCst);
    debug_assert!(!was_queued, "task {} double-enqueued", task.record.tid);
    let mut queue = RUNQ[cpu % MAX_CPU].queue.lock();
    queue.push_back(task);
    queue.unlock();
}

fn next_to_run(cpu: usize) -> Option<Box<Task>> {
    let mut queue = RUNQ[cpu].queue.lock();
    let task = queue.pop_front();
    queue.unlock();
    if let Some(task) = task.as_ref() {
        task.record.queued.store(false, Ordering::SeqCst);
    }
    task
}

/// Yield the CPU: run the next task from this CPU's queue, or the idle
/// task when the queue is empty.
///
/// Entry invariants: not on a borrowed stack frame of another task, no
/// spinlock held (checked via the interrupt-guard depth), and interrupts
/// get disabled for the switch itself.
pub fn reschedule() {
    assert!(
        !InterruptGuard::is_guarded(),
        "tried to reschedule while holding a spinlock"
    );
    unsafe { InterruptState::disable() };
    let cpu = cpu_id();
    match next_to_run(cpu) {
        Some(task) => task.run(),
        None => {
            let idle = IDLE[cpu].load(Ordering::SeqCst) as *mut Task;
            if let Some(idle) = unsafe { idle.as_mut() } {
                unsafe { idle.do_run() };
            }
        }
    }
    unsafe { InterruptState::enable() };
}

/// The timer interrupt: CPU 0 advances the clock and wakes the timing
/// wheel, then every CPU yields whatever it was running.
pub fn timer_interrupt() {
    if cpu_id() == 0 {
        super::clock::on_tick();
    }
    reschedule();
}

/// Transmute the boot stack of `core_id` into that CPU's idle task and
/// enter the idle loop. Called once per CPU at the end of boot; requires
/// the boot stack to be a `STACK_SIZE`-aligned heap block.
///
/// # Safety
/// Must be the last thing the boot path calls on this CPU.
pub unsafe fn idle(core_id: usize) -> ! {
    let mut sp: usize;
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) sp);
    }

    let record = super::TaskRecord::new(usize::MAX - core_id, 0, 0);
    record.affinity.store(core_id, Ordering::SeqCst);
    record.set_state(TaskState::Idle);
    let mut task = Task::new(record);
    unsafe {
        // Adopt the running stack; the freshly allocated one is dropped.
        task.stack = Box::from_raw((sp & !(super::STACK_SIZE - 1)) as *mut super::TaskStack);
    }
    task.stack.magic = super::TASK_MAGIC;
    task.stack.task = task.as_mut() as *mut _;
    IDLE[core_id].store(Box::into_raw(task) as usize, Ordering::SeqCst);

    loop {
        if let Some(task) = next_to_run(core_id) {
            unsafe { InterruptState::disable() };
            task.run();
            unsafe { InterruptState::enable() };
        }
        halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::TaskRecord;

    fn dummy(tid: usize) -> Box<Task> {
        let record = TaskRecord::new(tid, tid, 1);
        record.set_state(TaskState::Runnable);
        Task::new(record)
    }

    #[test]
    fn fifo_order_per_cpu() {
        let a = dummy(101);
        let b = dummy(102);
        enqueue_on(3, a);
        enqueue_on(3, b);
        let first = next_to_run(3).unwrap();
        let second = next_to_run(3).unwrap();
        assert_eq!(first.record.tid, 101);
        assert_eq!(second.record.tid, 102);
        assert!(next_to_run(3).is_none());
        assert!(!first.record.queued.load(Ordering::SeqCst));
    }

    #[test]
    fn enqueue_routes_to_home_cpu() {
        roost::set_ncpu(MAX_CPU);
        let task = dummy(205);
        let home = task.record.affinity.load(Ordering::SeqCst);
        assert_eq!(home, 205 % MAX_CPU);
        enqueue(task);
        for cpu in 0..MAX_CPU {
            let popped = next_to_run(cpu);
            assert_eq!(popped.is_some(), cpu == home);
        }
    }
}
