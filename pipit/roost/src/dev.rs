//! Device collaborator contracts.
//!
//! The kernel core never talks to hardware directly; drivers register
//! themselves here and the core reaches them through these traits. The
//! status codes mirror the kernel's error numbering so a driver can complete
//! a request with the value the caller will ultimately return.

use crate::spinlock::SpinLock;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};

/// Request still in flight.
pub const FETCH_AGAIN: i32 = -11;
/// Request completed successfully.
pub const FETCH_OK: i32 = 0;
/// Request failed with a hardware error.
pub const FETCH_IO: i32 = -5;

/// A block device.
///
/// `read_nonblocking` must set `*status` to [`FETCH_AGAIN`] when it queues
/// the request, and later store [`FETCH_OK`] or [`FETCH_IO`] and call
/// [`notify_disk_completion`] when the transfer finishes. A synchronous
/// device may store the final status before returning.
pub trait BlockDevice: Sync + Send {
    /// Device capacity in bytes.
    fn size(&self) -> usize;

    /// Start reading `buf.len()` bytes at byte offset `off`.
    ///
    /// Returns whether the request was issued. The completion status is
    /// reported through `status`.
    fn read_nonblocking(&self, buf: &mut [u8], off: usize, status: &AtomicI32) -> bool;

    /// Write `buf` at byte offset `off`, blocking until complete.
    ///
    /// Returns 0 on success or a negative error.
    fn write(&self, buf: &[u8], off: usize, status: &AtomicI32) -> i32;
}

static BLOCK_DEVICE: SpinLock<Option<&'static dyn BlockDevice>> = SpinLock::new(None);
static DISK_COMPLETION: SpinLock<Option<fn()>> = SpinLock::new(None);

/// Register the disk the filesystem lives on.
pub fn register_block_device(dev: &'static dyn BlockDevice) {
    let mut guard = BLOCK_DEVICE.lock();
    *guard = Some(dev);
    guard.unlock();
}

/// The registered disk, if any.
pub fn block_device() -> Option<&'static dyn BlockDevice> {
    let guard = BLOCK_DEVICE.lock();
    let dev = *guard;
    guard.unlock();
    dev
}

/// Register the kernel-side completion hook the driver invokes after each
/// finished transfer.
pub fn register_disk_completion(hook: fn()) {
    let mut guard = DISK_COMPLETION.lock();
    *guard = Some(hook);
    guard.unlock();
}

/// Called by the driver once per completed transfer.
pub fn notify_disk_completion() {
    let guard = DISK_COMPLETION.lock();
    let hook = *guard;
    guard.unlock();
    if let Some(hook) = hook {
        hook();
    }
}

/// The keyboard/console collaborator.
pub trait Teletype: Sync + Send {
    /// Write bytes to the console. Returns the number written.
    fn write(&self, data: &[u8]) -> usize;

    /// Non-blocking read of buffered input. Returns the number of bytes
    /// copied, 0 when no complete line is pending.
    fn read(&self, data: &mut [u8]) -> usize;
}

static TELETYPE: SpinLock<Option<&'static dyn Teletype>> = SpinLock::new(None);
static TELETYPE_READY: SpinLock<Option<fn()>> = SpinLock::new(None);

/// Register the keyboard/console device.
pub fn register_teletype(tty: &'static dyn Teletype) {
    let mut guard = TELETYPE.lock();
    *guard = Some(tty);
    guard.unlock();
}

/// The registered keyboard/console, if any.
pub fn teletype() -> Option<&'static dyn Teletype> {
    let guard = TELETYPE.lock();
    let tty = *guard;
    guard.unlock();
    tty
}

/// Register the hook the keyboard driver invokes when input becomes
/// available.
pub fn register_teletype_ready(hook: fn()) {
    let mut guard = TELETYPE_READY.lock();
    *guard = Some(hook);
    guard.unlock();
}

/// Called by the keyboard driver when a line is ready to read.
pub fn notify_teletype_ready() {
    let guard = TELETYPE_READY.lock();
    let hook = *guard;
    guard.unlock();
    if let Some(hook) = hook {
        hook();
    }
}

/// A memory-backed block device.
///
/// Completes every request synchronously, which makes it both the test disk
/// and the reference behavior for the non-blocking read contract.
pub struct RamDisk {
    data: SpinLock<Vec<u8>>,
}

impl RamDisk {
    /// A zero-filled disk of `size` bytes.
    pub fn new(size: usize) -> Self {
        let mut data = Vec::new();
        data.resize(size, 0);
        Self {
            data: SpinLock::new(data),
        }
    }

    /// A disk initialized with `image`.
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            data: SpinLock::new(image),
        }
    }
}

impl BlockDevice for RamDisk {
    fn size(&self) -> usize {
        let guard = self.data.lock();
        let size = guard.len();
        guard.unlock();
        size
    }

    fn read_nonblocking(&self, buf: &mut [u8], off: usize, status: &AtomicI32) -> bool {
        let guard = self.data.lock();
        let r = if off + buf.len() <= guard.len() {
            buf.copy_from_slice(&guard[off..off + buf.len()]);
            FETCH_OK
        } else {
            FETCH_IO
        };
        guard.unlock();
        status.store(r, Ordering::SeqCst);
        notify_disk_completion();
        true
    }

    fn write(&self, buf: &[u8], off: usize, status: &AtomicI32) -> i32 {
        let mut guard = self.data.lock();
        let r = if off + buf.len() <= guard.len() {
            guard[off..off + buf.len()].copy_from_slice(buf);
            FETCH_OK
        } else {
            FETCH_IO
        };
        guard.unlock();
        status.store(r, Ordering::SeqCst);
        notify_disk_completion();
        r
    }
}
