//! Per-connection framed message state.
//!
//! A `Wire` remembers partially received and partially sent frames across
//! calls, so the same routines can be driven from an edge- or
//! level-triggered event loop without ever blocking: callers retry on
//! `Again` when the next readiness event arrives. Frame bodies are opaque
//! bytes at this layer; `proto` gives them meaning.

use crate::net::buffer::Buffer;
use crate::net::fdpass;
use crate::net::netstring;
use crate::net::support::{Cause, NetError, NetResult};
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Default per-connection frame ceiling.
pub const DEFAULT_LIMIT: usize = 1 << 20;

// envelope slack on top of the body ceiling: length digits, ':' and ','
const ENVELOPE_SLACK: usize = 32;

pub struct Wire {
    rbuf: Buffer,
    wbuf: Buffer,
    limit: usize,
}

impl Wire {
    pub fn new() -> Wire {
        Wire::with_limit(DEFAULT_LIMIT)
    }

    /// A wire whose received frames may not exceed `limit` body bytes.
    pub fn with_limit(limit: usize) -> Wire {
        Wire {
            rbuf: Buffer::new(limit + ENVELOPE_SLACK),
            wbuf: Buffer::new(limit + ENVELOPE_SLACK),
            limit,
        }
    }

    /// Drop any partial state. Call between requests when a connection is
    /// reused for pipelining.
    pub fn reset(&mut self) {
        self.rbuf.clear();
        self.wbuf.clear();
    }

    /// Receive one complete frame body. Partial frames are buffered across
    /// calls; `Again` means more readiness is needed. EOF before a complete
    /// frame is `Cause::Closed`.
    pub fn recv_msg<R: io::Read>(&mut self, mut reader: R) -> NetResult<Vec<u8>> {
        loop {
            if !self.rbuf.is_empty() {
                match netstring::parse(self.rbuf.data(), self.limit) {
                    Ok(parsed) => {
                        let body = parsed.body(self.rbuf.data()).to_vec();
                        self.rbuf.consume(parsed.consumed);
                        return Ok(body);
                    }
                    Err(NetError::Again) => {}
                    Err(err) => return Err(err),
                }
            }

            if self.rbuf.fill_from(&mut reader)? == 0 {
                return Err(NetError::Fatal(Cause::Closed));
            }
        }
    }

    /// Pull everything the kernel currently holds into the receive buffer,
    /// up to one frame ceiling's worth. Required with an edge-triggered
    /// multiplexer, where unread socket data produces no further events.
    /// Returns true once the peer has closed.
    pub fn pump<R: io::Read>(&mut self, mut reader: R) -> NetResult<bool> {
        // room for one max-sized frame including its envelope; anything
        // beyond that stays in the kernel until a frame is consumed
        while self.rbuf.len() < self.rbuf.capacity() {
            match self.rbuf.fill_from(&mut reader) {
                Ok(0) => return Ok(true),
                Ok(_) => {}
                Err(NetError::Again) => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    /// Extract the next complete frame from the receive buffer, if any.
    pub fn take_frame(&mut self) -> NetResult<Option<Vec<u8>>> {
        if self.rbuf.is_empty() {
            return Ok(None);
        }
        match netstring::parse(self.rbuf.data(), self.limit) {
            Ok(parsed) => {
                let body = parsed.body(self.rbuf.data()).to_vec();
                self.rbuf.consume(parsed.consumed);
                Ok(Some(body))
            }
            Err(NetError::Again) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// True when a complete frame is already buffered and can be consumed
    /// without touching the socket.
    pub fn has_frame(&self) -> bool {
        !self.rbuf.is_empty() && netstring::parse(self.rbuf.data(), self.limit).is_ok()
    }

    /// Queue one frame for sending. Any previously queued frame must have
    /// drained first.
    pub fn set_msg(&mut self, body: &[u8]) -> NetResult<()> {
        debug_assert!(self.wbuf.is_empty(), "previous frame still in flight");
        self.wbuf.clear();
        self.wbuf.append(&netstring::encode(body))
    }

    /// Push queued frame bytes out. `Ok` once fully drained; `Again`
    /// preserves progress for the next writable event.
    pub fn send_pending<W: io::Write>(&mut self, writer: W) -> NetResult<()> {
        self.wbuf.drain_to(writer).map(|_| ())
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.wbuf.is_empty()
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for Wire {
    fn default() -> Wire {
        Wire::new()
    }
}

/// Blocking client end of a service socket. Used by command-line tools and
/// tests; daemons drive `Wire` directly from their event loops.
pub struct Client {
    stream: UnixStream,
    wire: Wire,
}

impl Client {
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Client> {
        Ok(Client {
            stream: UnixStream::connect(path)?,
            wire: Wire::new(),
        })
    }

    pub fn from_stream(stream: UnixStream) -> Client {
        Client {
            stream,
            wire: Wire::new(),
        }
    }

    pub fn send_msg(&mut self, body: &[u8]) -> NetResult<()> {
        self.wire.set_msg(body)?;
        self.wire.send_pending(&mut self.stream)
    }

    pub fn recv_msg(&mut self) -> NetResult<Vec<u8>> {
        self.wire.recv_msg(&mut self.stream)
    }

    /// Pass a descriptor to the service. The client keeps its own copy;
    /// close it separately if it should not stay open on this side.
    pub fn send_fd<F: AsFd>(&mut self, fd: F) -> NetResult<()> {
        fdpass::send_fd(self.stream.as_fd(), fd.as_fd(), 0)
    }

    pub fn recv_fd(&mut self) -> NetResult<OwnedFd> {
        fdpass::recv_fd(self.stream.as_fd())
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }
}
