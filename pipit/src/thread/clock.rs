//! The tick counter and the timing wheel.
//!
//! CPU 0's timer interrupt advances `ticks` (one tick per 10 ms) and wakes
//! the wheel spoke `ticks % WHEEL_SPOKES`. A sleeper computes its wake
//! tick, parks on the spoke that tick will hash to, and re-checks the
//! clock on every lap until it has expired or the task was interrupted.

use crate::sync::{SpinLock, WaitQueue, wait_until};
use crate::thread::current_record;
use crate::KernelError;
use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupts per second on CPU 0.
pub const HZ: u64 = 100;
/// Number of wait queues in the timing wheel.
pub const WHEEL_SPOKES: usize = 8;

static TICKS: AtomicU64 = AtomicU64::new(0);
static WHEEL: [WaitQueue; WHEEL_SPOKES] = [const { WaitQueue::new() }; WHEEL_SPOKES];
static SLEEP_LOCK: SpinLock<()> = SpinLock::new(());

/// Timer interrupts observed so far on CPU 0.
#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::SeqCst)
}

/// Advance the clock by one tick and wake the spoke it lands on.
pub fn on_tick() {
    let now = TICKS.fetch_add(1, Ordering::SeqCst) + 1;
    WHEEL[(now % WHEEL_SPOKES as u64) as usize].wake_all();
}

/// Wake every sleeper regardless of its spoke. Used by `exit` to deliver
/// `interrupted` to sleeping children promptly.
pub fn wake_all_spokes() {
    for spoke in WHEEL.iter() {
        spoke.wake_all();
    }
}

pub(crate) fn wake_tick_for(now: u64, msec: u64) -> u64 {
    now + msec.div_ceil(1000 / HZ)
}

/// Sleep for at least `msec` milliseconds.
///
/// Returns `Err(Interrupted)` when the task was woken with its
/// `interrupted` flag set (its parent exited).
pub fn msleep(msec: u64) -> Result<(), KernelError> {
    let wake_tick = wake_tick_for(ticks(), msec);
    let wq = &WHEEL[(wake_tick % WHEEL_SPOKES as u64) as usize];
    loop {
        let guard = SLEEP_LOCK.lock();
        let guard = wait_until(wq, &SLEEP_LOCK, guard, |_| {
            ticks() >= wake_tick
                || current_record().is_some_and(|r| r.interrupted.load(Ordering::SeqCst))
        });
        guard.unlock();
        if let Some(record) = current_record() {
            if record.interrupted.swap(false, Ordering::SeqCst) {
                return Err(KernelError::Interrupted);
            }
        }
        if ticks() >= wake_tick {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_tick_rounds_up() {
        assert_eq!(wake_tick_for(0, 1000), 100);
        assert_eq!(wake_tick_for(7, 95), 7 + 10);
        assert_eq!(wake_tick_for(3, 1), 4);
        assert_eq!(wake_tick_for(3, 0), 3);
    }

    #[test]
    fn ticks_advance_and_hash_to_spokes() {
        let before = ticks();
        on_tick();
        assert_eq!(ticks(), before + 1);
        // The spoke a sleeper parks on is the one its wake tick hashes to.
        let wake = wake_tick_for(ticks(), 40);
        assert_eq!((wake % WHEEL_SPOKES as u64) as usize, (wake as usize) % 8);
    }

    #[test]
    fn immediate_deadline_returns_without_parking() {
        // With no current task the sleep path cannot park; a deadline that
        // has already passed must come straight back.
        assert_eq!(msleep(0), Ok(()));
    }
}
