//! Files, file-descriptor tables, and the vnode seam.
//!
//! A [`File`] is an open handle: type, access mode, offset, and a
//! reference-counted [`Vnode`] that does the actual I/O. Threads of one
//! group share a single [`FdTable`]; `fork` duplicates the table entry by
//! entry (each entry another reference to the same open file), `clone`
//! shares the table itself, and the last releaser tears it down.

pub mod pipe;

use crate::sync::{SpinLock, WaitQueue, wait_until};
use crate::KernelError;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use num_enum::TryFromPrimitive;

/// Number of descriptor slots per process group.
pub const NFDS: usize = 256;

/// What an open file refers to.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum FileType {
    /// The keyboard/console stream.
    Stream,
    /// One end of a pipe.
    Pipe,
    /// A regular on-disk file.
    Regular,
    /// A directory.
    Directory,
}

/// The object behind an open file.
///
/// Default implementations reject the operation, so a stream only has to
/// provide what it supports.
pub trait Vnode: Send + Sync {
    /// Read up to `buf.len()` bytes at `*off`, advancing it.
    fn read(&self, _buf: &mut [u8], _off: &mut usize) -> Result<usize, KernelError> {
        Err(KernelError::NotPermitted)
    }

    /// Write `buf` at `*off`, advancing it.
    fn write(&self, _buf: &[u8], _off: &mut usize) -> Result<usize, KernelError> {
        Err(KernelError::NotPermitted)
    }

    /// Current size in bytes.
    fn size(&self) -> Result<usize, KernelError> {
        Err(KernelError::NotPermitted)
    }

    /// Called once when the last handle with the given access drops.
    fn on_close(&self, _readable: bool, _writeable: bool) {}
}

/// `lseek` positioning modes.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(usize)]
pub enum Whence {
    /// Absolute offset.
    Set = 0,
    /// Relative to the current offset.
    Cur = 1,
    /// Relative to the end of the file.
    End = 2,
    /// Report the file size without moving the offset.
    Size = 3,
}

/// An open file handle.
pub struct File {
    /// What kind of object the handle refers to.
    pub kind: FileType,
    /// Whether reads are permitted.
    pub readable: bool,
    /// Whether writes are permitted.
    pub writeable: bool,
    offset: SpinLock<usize>,
    vnode: Arc<dyn Vnode>,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("kind", &self.kind)
            .field("readable", &self.readable)
            .field("writeable", &self.writeable)
            .finish()
    }
}

impl File {
    /// Open a new handle onto `vnode`.
    pub fn new(kind: FileType, readable: bool, writeable: bool, vnode: Arc<dyn Vnode>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            readable,
            writeable,
            offset: SpinLock::new(0),
            vnode,
        })
    }

    /// Read at the current offset, advancing it by the amount read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        if !self.readable {
            return Err(KernelError::BadFileDescriptor);
        }
        let guard = self.offset.lock();
        let mut off = *guard;
        guard.unlock();
        let n = self.vnode.read(buf, &mut off)?;
        let mut guard = self.offset.lock();
        *guard = off;
        guard.unlock();
        Ok(n)
    }

    /// Write at the current offset, advancing it by the amount written.
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        if !self.writeable {
            return Err(KernelError::BadFileDescriptor);
        }
        let guard = self.offset.lock();
        let mut off = *guard;
        guard.unlock();
        let n = self.vnode.write(buf, &mut off)?;
        let mut guard = self.offset.lock();
        *guard = off;
        guard.unlock();
        Ok(n)
    }

    /// Reposition the offset. Only regular files are seekable.
    pub fn seek(&self, off: isize, whence: Whence) -> Result<usize, KernelError> {
        if self.kind != FileType::Regular {
            return Err(KernelError::IllegalSeek);
        }
        let size = self.vnode.size()?;
        if whence == Whence::Size {
            return Ok(size);
        }
        let mut guard = self.offset.lock();
        let base = match whence {
            Whence::Set => 0isize,
            Whence::Cur => *guard as isize,
            Whence::End => size as isize,
            Whence::Size => unreachable!(),
        };
        let target = base + off;
        if target < 0 {
            guard.unlock();
            return Err(KernelError::InvalidArgument);
        }
        *guard = target as usize;
        guard.unlock();
        Ok(target as usize)
    }

    /// The vnode behind this handle.
    pub fn vnode(&self) -> &Arc<dyn Vnode> {
        &self.vnode
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.vnode.on_close(self.readable, self.writeable);
    }
}

/// A process group's descriptor table: a fixed array of open-file
/// references, shared by `clone` siblings via `Arc` and destroyed with the
/// last thread.
pub struct FdTable {
    files: SpinLock<[Option<Arc<File>>; NFDS]>,
}

impl FdTable {
    /// An empty table.
    pub fn new() -> Arc<Self> {
        const NONE: Option<Arc<File>> = None;
        Arc::new(Self {
            files: SpinLock::new([NONE; NFDS]),
        })
    }

    /// Install `file` at the lowest free descriptor.
    pub fn install(&self, file: Arc<File>) -> Result<usize, KernelError> {
        let mut guard = self.files.lock();
        let slot = guard.iter().position(|f| f.is_none());
        let r = match slot {
            Some(fd) => {
                guard[fd] = Some(file);
                Ok(fd)
            }
            None => Err(KernelError::TooManyOpenFiles),
        };
        guard.unlock();
        r
    }

    /// The file open at `fd`.
    pub fn get(&self, fd: usize) -> Result<Arc<File>, KernelError> {
        let guard = self.files.lock();
        let file = guard.get(fd).and_then(|f| f.clone());
        guard.unlock();
        file.ok_or(KernelError::BadFileDescriptor)
    }

    /// Make `newfd` refer to the file open at `oldfd`, closing whatever
    /// `newfd` referred to before.
    pub fn dup2(&self, oldfd: usize, newfd: usize) -> Result<usize, KernelError> {
        if newfd >= NFDS {
            return Err(KernelError::BadFileDescriptor);
        }
        let file = self.get(oldfd)?;
        let mut guard = self.files.lock();
        let previous = guard[newfd].replace(file);
        guard.unlock();
        drop(previous);
        Ok(newfd)
    }

    /// Drop the reference held at `fd`.
    pub fn close(&self, fd: usize) -> Result<(), KernelError> {
        let mut guard = self.files.lock();
        let file = guard.get_mut(fd).and_then(|f| f.take());
        guard.unlock();
        file.map(|_| ()).ok_or(KernelError::BadFileDescriptor)
    }

    /// Drop every open reference. Called exactly once, at group exit.
    pub fn close_all(&self) {
        let mut guard = self.files.lock();
        let mut taken: [Option<Arc<File>>; NFDS] = [const { None }; NFDS];
        core::mem::swap(&mut *guard, &mut taken);
        guard.unlock();
        drop(taken);
    }

    /// A new table holding another reference to every open file. Used by
    /// `fork`.
    pub fn duplicate(&self) -> Arc<Self> {
        let copy = Self::new();
        let guard = self.files.lock();
        let mut dst = copy.files.lock();
        for (d, s) in dst.iter_mut().zip(guard.iter()) {
            *d = s.clone();
        }
        dst.unlock();
        guard.unlock();
        copy
    }
}

// The keyboard/console stream.

static KBD_WQ: WaitQueue = WaitQueue::new();
static KBD_LOCK: SpinLock<()> = SpinLock::new(());
static KBD_READY: AtomicBool = AtomicBool::new(false);

fn keyboard_ready() {
    KBD_READY.store(true, Ordering::SeqCst);
    KBD_WQ.wake_all();
}

/// Hook the keyboard driver's readiness notification into the console wait
/// queue. Called once during boot.
pub fn init() {
    roost::dev::register_teletype_ready(keyboard_ready);
}

/// The keyboard/console vnode behind descriptors 0, 1, and 2.
pub struct Console;

impl Vnode for Console {
    fn read(&self, buf: &mut [u8], _off: &mut usize) -> Result<usize, KernelError> {
        let tty = roost::dev::teletype().ok_or(KernelError::Io)?;
        loop {
            let n = tty.read(buf);
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            let guard = KBD_LOCK.lock();
            let guard = wait_until(&KBD_WQ, &KBD_LOCK, guard, |_| KBD_READY.load(Ordering::SeqCst));
            KBD_READY.store(false, Ordering::SeqCst);
            guard.unlock();
        }
    }

    fn write(&self, buf: &[u8], _off: &mut usize) -> Result<usize, KernelError> {
        match roost::dev::teletype() {
            Some(tty) => Ok(tty.write(buf)),
            None => {
                // Early boot: fall back to the kernel console.
                if let Ok(s) = core::str::from_utf8(buf) {
                    print!("{}", s);
                }
                Ok(buf.len())
            }
        }
    }
}

/// A fresh handle on the keyboard/console, as installed at fds 0-2.
pub fn console_file() -> Arc<File> {
    File::new(FileType::Stream, true, true, Arc::new(Console))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullVnode;
    impl Vnode for NullVnode {}

    fn null_file() -> Arc<File> {
        File::new(FileType::Regular, true, true, Arc::new(NullVnode))
    }

    #[test]
    fn install_uses_lowest_free_slot() {
        let table = FdTable::new();
        assert_eq!(table.install(null_file()).unwrap(), 0);
        assert_eq!(table.install(null_file()).unwrap(), 1);
        table.close(0).unwrap();
        assert_eq!(table.install(null_file()).unwrap(), 0);
    }

    #[test]
    fn close_invalidates_descriptor() {
        let table = FdTable::new();
        let fd = table.install(null_file()).unwrap();
        table.close(fd).unwrap();
        assert_eq!(table.get(fd).unwrap_err(), KernelError::BadFileDescriptor);
        assert_eq!(table.close(fd).unwrap_err(), KernelError::BadFileDescriptor);
    }

    #[test]
    fn dup2_replaces_target() {
        let table = FdTable::new();
        let a = table.install(null_file()).unwrap();
        let b = table.install(null_file()).unwrap();
        table.dup2(a, b).unwrap();
        let fa = table.get(a).unwrap();
        let fb = table.get(b).unwrap();
        assert!(Arc::ptr_eq(&fa, &fb));
    }

    #[test]
    fn duplicate_shares_open_files() {
        let table = FdTable::new();
        let fd = table.install(null_file()).unwrap();
        let copy = table.duplicate();
        assert!(Arc::ptr_eq(&table.get(fd).unwrap(), &copy.get(fd).unwrap()));
        // Closing in one table leaves the other intact.
        table.close(fd).unwrap();
        assert!(copy.get(fd).is_ok());
    }

    #[test]
    fn close_all_releases_every_reference() {
        let table = FdTable::new();
        let f = null_file();
        let fd = table.install(f.clone()).unwrap();
        table.dup2(fd, 7).unwrap();
        assert_eq!(Arc::strong_count(&f), 3);
        // Group exit drops every descriptor exactly once.
        table.close_all();
        assert_eq!(Arc::strong_count(&f), 1);
    }

    #[test]
    fn seek_rejects_streams() {
        let f = File::new(FileType::Stream, true, true, Arc::new(NullVnode));
        assert_eq!(f.seek(0, Whence::Set).unwrap_err(), KernelError::IllegalSeek);
    }
}
