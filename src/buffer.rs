//! An application-level growable FIFO byte buffer with prepend headroom.
//!
//! Modeled after the muduo `Buffer` (`net/include/Buffer.h`): a single
//! contiguous region with `prependable | readable | writable` regions,
//! `reader <= writer <= size`, and an 8-byte reserved headroom so protocol
//! framing code can stamp a length prefix in place without a second
//! allocation.

use std::io;
use std::os::fd::RawFd;

use crate::sys::net as sys_net;

/// Bytes reserved at the front of the buffer for in-place header writes.
pub const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;
/// Size of the stack-allocated overflow region `read_fd` uses so a single
/// `readv` can absorb a burst larger than the buffer's current writable
/// window without pre-resizing.
const EXTRA_BUF_SIZE: usize = 65536;

/// A growable byte FIFO: data is [`append`](Buffer::append)ed at the back and
/// [`retrieve`](Buffer::retrieve)d from the front.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial_size],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// The readable window, `[reader, writer)`.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Advances the read cursor by `len`, or resets to empty if `len`
    /// reaches or exceeds what's readable.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let len = self.readable_bytes();
        self.retrieve_as_vec(len)
    }

    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_vec()).into_owned()
    }

    /// Grows the buffer (compacting first if that's cheap enough) so at
    /// least `len` writable bytes are available.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn begin_write_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.writer..]
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let writer = self.writer;
        self.buf[writer..writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() - CHEAP_PREPEND < len {
            self.buf.resize(self.writer + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// A scatter read into the buffer's writable window plus a 64 KB
    /// extension, in one system call — handles both small reads and large
    /// bursts without pre-resizing the buffer for the worst case.
    ///
    /// Returns `0` on orderly close (peer shut down its write side), `Ok(n)`
    /// for `n` bytes read, or the underlying I/O error (including
    /// `WouldBlock`).
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let mut slices = [
            io::IoSliceMut::new(self.begin_write_mut()),
            io::IoSliceMut::new(&mut extra),
        ];
        let n = sys_net::readv(fd, &mut slices)?;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the current readable window in one system call. The caller is
    /// responsible for calling [`retrieve`](Buffer::retrieve) with the
    /// returned count.
    pub fn write_fd(&self, fd: RawFd) -> io::Result<usize> {
        sys_net::write(fd, self.peek())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_retrieve_all_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.retrieve_all_as_string(), "hello world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn partial_retrieve_advances_reader() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        buf.retrieve(2);
        assert_eq!(buf.peek(), b"llo");
    }

    #[test]
    fn growth_beyond_initial_capacity_preserves_content() {
        let mut buf = Buffer::with_capacity(4);
        let data = vec![7u8; 4096];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 4096);
        assert_eq!(buf.peek(), data.as_slice());
    }

    #[test]
    fn compaction_preserves_headroom() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789012345"); // fills writable window exactly
        buf.retrieve(10); // free up prependable-adjacent space via compaction
        buf.append(b"more");
        assert_eq!(buf.peek(), b"012345more");
    }

    #[test]
    fn retrieve_more_than_readable_resets() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(100);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }
}
