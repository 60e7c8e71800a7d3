//! Pipes: a bounded circular buffer between two file handles.

use super::{File, FileType, Vnode};
use crate::sync::{SpinLock, WaitQueue, wait_until};
use crate::KernelError;
use alloc::sync::Arc;

/// Capacity of a pipe's buffer.
pub const BBUFFER_SIZE: usize = 128;

struct BbState {
    buf: [u8; BBUFFER_SIZE],
    pos: usize,
    len: usize,
    read_closed: bool,
    write_closed: bool,
}

/// The circular byte buffer backing one pipe.
///
/// Readers block on `nonempty` until bytes or EOF arrive; writers block on
/// `nonfull` until space or a broken pipe appears.
pub struct BoundedBuffer {
    state: SpinLock<BbState>,
    nonempty: WaitQueue,
    nonfull: WaitQueue,
}

impl BoundedBuffer {
    /// An empty, open buffer.
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(BbState {
                buf: [0; BBUFFER_SIZE],
                pos: 0,
                len: 0,
                read_closed: false,
                write_closed: false,
            }),
            nonempty: WaitQueue::new(),
            nonfull: WaitQueue::new(),
        }
    }

    /// Read up to `out.len()` bytes. Blocks while the buffer is empty and
    /// the write end is still open; a drained, write-closed buffer reads as
    /// end-of-file (`Ok(0)`).
    pub fn read(&self, out: &mut [u8]) -> Result<usize, KernelError> {
        let mut guard = self.state.lock();
        if guard.len == 0 {
            guard = wait_until(&self.nonempty, &self.state, guard, |s| {
                out.is_empty() || s.len > 0 || s.write_closed
            });
        }
        if guard.write_closed && guard.len == 0 {
            guard.unlock();
            return Ok(0);
        }

        let mut copied = 0;
        while copied < out.len() && guard.len > 0 {
            let mut ncopy = out.len() - copied;
            ncopy = ncopy.min(BBUFFER_SIZE - guard.pos).min(guard.len);
            let pos = guard.pos;
            out[copied..copied + ncopy].copy_from_slice(&guard.buf[pos..pos + ncopy]);
            guard.pos = (guard.pos + ncopy) % BBUFFER_SIZE;
            guard.len -= ncopy;
            copied += ncopy;
        }
        guard.unlock();

        self.nonfull.wake_all();
        Ok(copied)
    }

    /// Write up to `data.len()` bytes. Blocks while the buffer is full and
    /// the read end is still open; a closed read end is a broken pipe.
    pub fn write(&self, data: &[u8]) -> Result<usize, KernelError> {
        let mut guard = self.state.lock();
        if guard.len == BBUFFER_SIZE {
            guard = wait_until(&self.nonfull, &self.state, guard, |s| {
                data.is_empty() || s.len < BBUFFER_SIZE || s.read_closed
            });
        }
        if guard.read_closed {
            guard.unlock();
            return Err(KernelError::BrokenPipe);
        }

        let mut copied = 0;
        while copied < data.len() && guard.len < BBUFFER_SIZE {
            let index = (guard.pos + guard.len) % BBUFFER_SIZE;
            let mut ncopy = data.len() - copied;
            ncopy = ncopy.min(BBUFFER_SIZE - index).min(BBUFFER_SIZE - guard.len);
            guard.buf[index..index + ncopy].copy_from_slice(&data[copied..copied + ncopy]);
            guard.len += ncopy;
            copied += ncopy;
        }
        guard.unlock();

        self.nonempty.wake_all();
        Ok(copied)
    }

    fn close(&self, readable: bool, writeable: bool) {
        let mut guard = self.state.lock();
        if readable {
            guard.read_closed = true;
        }
        if writeable {
            guard.write_closed = true;
        }
        guard.unlock();
        // Whichever side was waiting must observe the closure.
        if readable {
            self.nonfull.wake_all();
        }
        if writeable {
            self.nonempty.wake_all();
        }
    }
}

impl Default for BoundedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

struct PipeVnode {
    bb: BoundedBuffer,
}

impl Vnode for PipeVnode {
    fn read(&self, buf: &mut [u8], _off: &mut usize) -> Result<usize, KernelError> {
        self.bb.read(buf)
    }

    fn write(&self, buf: &[u8], _off: &mut usize) -> Result<usize, KernelError> {
        self.bb.write(buf)
    }

    fn on_close(&self, readable: bool, writeable: bool) {
        self.bb.close(readable, writeable);
    }
}

/// Create a pipe: one shared buffer behind a read handle and a write
/// handle.
pub fn make_pipe() -> (Arc<File>, Arc<File>) {
    let vnode = Arc::new(PipeVnode {
        bb: BoundedBuffer::new(),
    });
    let reader = File::new(FileType::Pipe, true, false, vnode.clone());
    let writer = File::new(FileType::Pipe, false, true, vnode);
    (reader, writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let (reader, writer) = make_pipe();
        assert_eq!(writer.write(b"abcde").unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(reader.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"abcde");
    }

    #[test]
    fn drained_pipe_reads_eof_after_writer_closes() {
        let (reader, writer) = make_pipe();
        writer.write(b"abcde").unwrap();
        drop(writer);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"abcde");
        assert_eq!(reader.read(&mut buf).unwrap(), 0, "EOF after drain");
    }

    #[test]
    fn write_after_reader_closes_is_broken_pipe() {
        let (reader, writer) = make_pipe();
        drop(reader);
        assert_eq!(writer.write(b"x").unwrap_err(), KernelError::BrokenPipe);
    }

    #[test]
    fn wraparound_preserves_byte_order() {
        let (reader, writer) = pipe_with_ring_offset(100);
        let data: alloc::vec::Vec<u8> = (0..100u8).collect();
        assert_eq!(writer.write(&data).unwrap(), 100);
        let mut buf = [0u8; 100];
        assert_eq!(reader.read(&mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn full_buffer_accepts_partial_write() {
        let (_reader, writer) = make_pipe();
        let big = [0x5au8; BBUFFER_SIZE + 32];
        assert_eq!(writer.write(&big).unwrap(), BBUFFER_SIZE);
    }

    // A pipe whose internal position has been pushed past `offset` so reads
    // and writes wrap the ring boundary.
    fn pipe_with_ring_offset(offset: usize) -> (Arc<File>, Arc<File>) {
        let (reader, writer) = make_pipe();
        let chunk = [0u8; 32];
        let mut moved = 0;
        while moved < offset {
            let n = chunk.len().min(offset - moved);
            writer.write(&chunk[..n]).unwrap();
            let mut sink = [0u8; 32];
            reader.read(&mut sink[..n]).unwrap();
            moved += n;
        }
        (reader, writer)
    }
}
