//! A byte FIFO for non-blocking stream I/O. Data is appended at the tail
//! and consumed from the head; the head region is compacted lazily so the
//! readable bytes always form one contiguous slice.

use crate::net::support::{Cause, NetError, NetResult};
use std::io;

/// Initial allocation for message buffers. Grows on demand up to the cap.
pub const INITIAL_SIZE: usize = 2048;

/// Reads pull at most this many bytes per call.
const READ_CHUNK: usize = 4096;

pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    cap: usize,
}

impl Buffer {
    /// A buffer that may hold at most `cap` buffered bytes.
    pub fn new(cap: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(INITIAL_SIZE.min(cap)),
            head: 0,
            cap,
        }
    }

    /// The number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.data.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// The buffered bytes, in order.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Drop `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "consume past end of buffer");
        self.head += count;
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head >= INITIAL_SIZE {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Append bytes at the tail.
    pub fn append(&mut self, bytes: &[u8]) -> NetResult<()> {
        if self.len() + bytes.len() > self.cap {
            return Err(NetError::Fatal(Cause::TooLarge));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Read once from `reader` into the tail. Returns the number of bytes
    /// read; zero means EOF. A full buffer is a `TooLarge` failure, not a
    /// short read.
    pub fn fill_from<R: io::Read>(&mut self, mut reader: R) -> NetResult<usize> {
        let room = self.cap - self.len();
        if room == 0 {
            return Err(NetError::Fatal(Cause::TooLarge));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let want = room.min(READ_CHUNK);
        let nread = reader.read(&mut chunk[..want]).map_err(NetError::from)?;
        self.data.extend_from_slice(&chunk[..nread]);
        Ok(nread)
    }

    /// Write buffered bytes to `writer` until the buffer drains or the
    /// writer blocks. Partial progress is consumed before `Again` is
    /// returned, so the caller can simply retry on the next writable event.
    pub fn drain_to<W: io::Write>(&mut self, mut writer: W) -> NetResult<usize> {
        let orig = self.len();

        while !self.is_empty() {
            match writer.write(self.data()) {
                Ok(0) => {
                    return Err(NetError::Fatal(Cause::Io(io::ErrorKind::WriteZero.into())))
                }
                Ok(n) => self.consume(n),
                Err(err) => {
                    let err = NetError::from(err);
                    if err.is_again() {
                        return Err(NetError::Again);
                    }
                    return Err(err);
                }
            }
        }

        Ok(orig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::{Read, Write};

    /// An in-memory peer that transfers at most `chunk` bytes per call and
    /// reports WouldBlock when drained/full.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }
    }

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    impl Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend_from_slice(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let payload: Vec<u8> = (0..1000u32).map(|v| v as u8).collect();
        let mut src = MockChannel::new(payload.clone(), 77, 0);
        let mut buffer = Buffer::new(4096);

        let mut total = 0;
        loop {
            match buffer.fill_from(&mut src) {
                Ok(n) => total += n,
                Err(err) => {
                    assert!(err.is_again());
                    break;
                }
            }
        }
        assert_eq!(total, payload.len());
        assert_eq!(buffer.data(), &payload[..]);

        let mut dst = MockChannel::new(Vec::new(), 77, payload.len());
        loop {
            match buffer.drain_to(&mut dst) {
                Ok(_) => break,
                Err(err) => assert!(err.is_again()),
            }
        }
        assert!(buffer.is_empty());
        assert_eq!(dst.data, payload);
    }

    #[test]
    fn test_partial_drain_keeps_progress() {
        let mut buffer = Buffer::new(64);
        buffer.append(b"hello world").unwrap();

        // peer accepts only 5 bytes, then blocks
        let mut dst = MockChannel::new(Vec::new(), 5, 5);
        assert_eq!(buffer.drain_to(&mut dst), Err(NetError::Again));
        assert_eq!(buffer.data(), b" world");

        dst.max_size = 64;
        buffer.drain_to(&mut dst).unwrap();
        assert_eq!(dst.data, b"hello world");
    }

    #[test]
    fn test_append_over_cap() {
        let mut buffer = Buffer::new(4);
        assert_eq!(
            buffer.append(b"hello"),
            Err(NetError::Fatal(Cause::TooLarge))
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fill_over_cap() {
        let mut src = MockChannel::new(vec![0; 32], 32, 0);
        let mut buffer = Buffer::new(16);
        buffer.fill_from(&mut src).unwrap();
        assert_eq!(buffer.len(), 16);
        assert_eq!(
            buffer.fill_from(&mut src),
            Err(NetError::Fatal(Cause::TooLarge))
        );
    }

    #[test]
    fn test_eof_reported_as_zero() {
        let mut buffer = Buffer::new(16);
        let empty: &[u8] = &[];
        assert_eq!(buffer.fill_from(empty).unwrap(), 0);
    }

    #[test]
    fn test_consume_compacts() {
        let mut buffer = Buffer::new(1 << 20);
        let blob = vec![7u8; INITIAL_SIZE * 2];
        buffer.append(&blob).unwrap();
        buffer.consume(INITIAL_SIZE + 10);
        assert_eq!(buffer.len(), INITIAL_SIZE - 10);
        assert_eq!(buffer.data(), &blob[INITIAL_SIZE + 10..]);
    }
}
