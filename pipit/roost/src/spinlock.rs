//! The interrupt-safe spinlock.
//!
//! Two rules shape this lock. First, acquisition disables local interrupts
//! before touching the lock word and keeps them off until release, so a
//! holder can never be preempted into the scheduler; the interrupt guard it
//! carries also feeds the per-CPU guard depth the scheduler refuses to run
//! under. Second, release is an explicit [`SpinLockGuard::unlock`] call:
//! a guard that merely goes out of scope is a bug, and it panics rather
//! than silently releasing, so every unlock site stays visible to a
//! lock-ordering audit.
//!
//! Contended acquisition spins on a plain load (with interrupts back on)
//! and only retries the atomic exchange once the word looks free, so a
//! waiting CPU does not hammer the cache line or starve interrupt delivery
//! while it waits.

use crate::interrupt::InterruptGuard;
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU8, Ordering},
};

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
pub struct WouldBlock;

/// A spinlock protecting a value of type `T`.
///
/// The value is reachable only through the guard returned by
/// [`SpinLock::lock`] or [`SpinLock::try_lock`].
pub struct SpinLock<T: ?Sized> {
    state: AtomicU8,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Wrap `value` in an unlocked spinlock.
    #[inline]
    pub const fn new(value: T) -> SpinLock<T> {
        SpinLock {
            state: AtomicU8::new(UNLOCKED),
            value: UnsafeCell::new(value),
        }
    }

    /// Unwrap the lock, returning the protected value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    // One acquisition attempt under an already-disabled interrupt state.
    // On failure the interrupt guard is handed back so the caller can
    // decide whether to re-enable while it spins.
    fn try_acquire(&self, irq: InterruptGuard) -> Result<SpinLockGuard<'_, T>, InterruptGuard> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(SpinLockGuard {
                lock: self,
                irq: ManuallyDrop::new(irq),
                _stay_on_cpu: PhantomData,
            })
        } else {
            Err(irq)
        }
    }

    /// Acquire the lock, spinning until it is free.
    ///
    /// Interrupts are disabled for the duration of the hold; between
    /// contended attempts they are restored while the lock word is watched
    /// with plain loads.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            match self.try_acquire(InterruptGuard::new()) {
                Ok(guard) => return guard,
                Err(irq) => drop(irq),
            }
            while self.state.load(Ordering::Relaxed) == LOCKED {
                crate::x86_64::pause();
            }
        }
    }

    /// A single acquisition attempt.
    ///
    /// # Errors
    /// [`WouldBlock`] when the lock is held by someone else.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        self.try_acquire(InterruptGuard::new())
            .map_err(|_| WouldBlock)
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(T::default())
    }
}

/// Exclusive access to the value inside a [`SpinLock`].
///
/// Holding the guard means interrupts are off on this CPU. The guard must
/// be consumed by [`SpinLockGuard::unlock`]; letting it drop panics.
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    irq: ManuallyDrop<InterruptGuard>,
    // Guards pin their interrupt state to the acquiring CPU.
    _stay_on_cpu: PhantomData<*mut ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Release the lock and restore the saved interrupt state.
    pub fn unlock(self) {
        let mut this = ManuallyDrop::new(self);
        this.lock.state.store(UNLOCKED, Ordering::Release);
        unsafe { ManuallyDrop::drop(&mut this.irq) };
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        panic!("spinlock guard leaked: release it with SpinLockGuard::unlock()");
    }
}
