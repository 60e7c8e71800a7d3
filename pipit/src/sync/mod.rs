//! Synchronization primitives.
//!
//! Spinlocks come from the architecture layer; wait queues and the
//! predicate-wait protocol built on top of them live here. Every blocking
//! path in the kernel goes through [`wait_queue::wait_until`].

pub mod wait_queue;

pub use roost::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
pub use wait_queue::{WaitQueue, wait_until};
