//! Wait queues and predicate-wait.
//!
//! A [`WaitQueue`] is a spinlock-guarded queue of parked tasks. Blocking
//! moves the task's execution context *into* the queue (a [`ParkHandle`]
//! owns it), and waking marks the task Runnable and hands it back to the
//! scheduler, which re-enqueues it on its home CPU. Because the handle is
//! linked under the queue lock before the task yields, a wakeup can never
//! be lost between the predicate check and the block.
//!
//! [`wait_until`] is the canonical blocking primitive. The caller passes
//! the guard of the spinlock protecting the predicate's state; the
//! predicate is only ever evaluated with that lock held, the lock is
//! released across the block, and it is reacquired before the next check.
//! A task whose `exiting` flag is set stops evaluating the predicate,
//! becomes Broken, wakes the waitpid queue, and never returns.

use crate::sync::{SpinLock, SpinLockGuard};
use crate::thread::{Current, ParkHandle, current_record, exit_broken};
use alloc::collections::VecDeque;

/// A queue of blocked tasks tied to one event.
pub struct WaitQueue {
    waiters: SpinLock<VecDeque<ParkHandle>>,
}

impl WaitQueue {
    /// An empty queue.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Park the current task on this queue, then run `before_block` while
    /// the task is linked but before it yields. Used to release a companion
    /// lock after the enqueue point.
    pub(crate) fn park_current(&self, before_block: impl FnOnce()) {
        Current::park_with(|handle| {
            let mut q = self.waiters.lock();
            q.push_back(handle);
            q.unlock();
            before_block();
        });
    }

    /// Wake one waiter, if any.
    pub fn wake_one(&self) {
        let mut q = self.waiters.lock();
        let handle = q.pop_front();
        q.unlock();
        if let Some(handle) = handle {
            handle.unpark();
        }
    }

    /// Wake every waiter, re-enqueuing each on its home CPU.
    pub fn wake_all(&self) {
        let mut woken = VecDeque::new();
        let mut q = self.waiters.lock();
        core::mem::swap(&mut *q, &mut woken);
        q.unlock();
        while let Some(handle) = woken.pop_front() {
            handle.unpark();
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Block on `wq` until `pred` holds.
///
/// `guard` must protect the state `pred` reads; it is released while the
/// task is blocked and reacquired before every evaluation. Returns the
/// reacquired guard once the predicate is satisfied.
///
/// If the current task is cancelled (`exiting` set by a group exit), the
/// companion lock is released and the task exits Broken without evaluating
/// the predicate again; the call does not return in that case.
pub fn wait_until<'a, T, F>(
    wq: &WaitQueue,
    lock: &'a SpinLock<T>,
    mut guard: SpinLockGuard<'a, T>,
    mut pred: F,
) -> SpinLockGuard<'a, T>
where
    F: FnMut(&mut T) -> bool,
{
    loop {
        if current_record().is_some_and(|r| r.is_exiting()) {
            guard.unlock();
            exit_broken();
        }
        if pred(&mut guard) {
            return guard;
        }
        let held = guard;
        wq.park_current(move || held.unlock());
        guard = lock.lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfied_predicate_never_parks() {
        // Without a current task there is nothing to park; a predicate that
        // already holds must come straight back with the lock held.
        let wq = WaitQueue::new();
        let lock = SpinLock::new(41usize);
        let mut guard = lock.lock();
        *guard += 1;
        let guard = wait_until(&wq, &lock, guard, |v| *v == 42);
        assert_eq!(*guard, 42);
        guard.unlock();
    }

    #[test]
    fn waking_an_empty_queue_is_a_no_op() {
        let wq = WaitQueue::new();
        wq.wake_one();
        wq.wake_all();
    }
}
