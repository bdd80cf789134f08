//! Status plumbing for non-blocking I/O paths.
//!
//! Event-loop code must distinguish "would block, re-arm and come back" from
//! "this connection is dead". `NetError::Again` is the former; everything
//! else is `Fatal` with a cause. Callers that only care about liveness can
//! match on the variant; callers producing peer-facing status responses use
//! the `Display` text.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug)]
pub enum NetError {
    /// The operation cannot make progress right now. Not an error; the
    /// caller re-arms interest and retries on the next readiness event.
    Again,
    Fatal(Cause),
}

#[derive(Debug)]
pub enum Cause {
    /// Orderly EOF where the protocol required more data.
    Closed,
    /// Framing violation.
    Malformed,
    /// Frame length over the configured ceiling.
    TooLarge,
    /// An fd-passing message arrived without a descriptor.
    NoFd,
    /// The peer passed an fd together with a nonzero error code.
    Peer(i32),
    Io(io::Error),
}

impl NetError {
    #[inline]
    pub fn is_again(&self) -> bool {
        matches!(self, NetError::Again)
    }

    #[inline]
    pub fn fatal(cause: Cause) -> NetError {
        NetError::Fatal(cause)
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> NetError {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetError::Again,
            _ => NetError::Fatal(Cause::Io(err)),
        }
    }
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetError::Again => write!(f, "operation would block"),
            NetError::Fatal(cause) => write!(f, "{}", cause),
        }
    }
}

impl std::fmt::Display for Cause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cause::Closed => write!(f, "connection terminated prematurely"),
            Cause::Malformed => write!(f, "malformed message"),
            Cause::TooLarge => write!(f, "request too large"),
            Cause::NoFd => write!(f, "no file descriptor received"),
            Cause::Peer(errno) => {
                write!(f, "peer error: {}", io::Error::from_raw_os_error(*errno))
            }
            Cause::Io(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for NetError {}

impl PartialEq for NetError {
    fn eq(&self, other: &NetError) -> bool {
        match (self, other) {
            (NetError::Again, NetError::Again) => true,
            (NetError::Fatal(a), NetError::Fatal(b)) => match (a, b) {
                (Cause::Closed, Cause::Closed)
                | (Cause::Malformed, Cause::Malformed)
                | (Cause::TooLarge, Cause::TooLarge)
                | (Cause::NoFd, Cause::NoFd) => true,
                (Cause::Peer(x), Cause::Peer(y)) => x == y,
                (Cause::Io(x), Cause::Io(y)) => x.kind() == y.kind(),
                _ => false,
            },
            _ => false,
        }
    }
}

/// `Read`/`Write` over a borrowed raw descriptor. Slots and probes own bare
/// fds rather than socket types, so buffered I/O goes through this adapter.
/// EINTR is retried internally; everything else is surfaced as-is.
pub struct FdIo<'a>(pub BorrowedFd<'a>);

impl io::Read for FdIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::read(self.0.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl io::Write for FdIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::write(self.0.as_raw_fd(), buf.as_ptr().cast(), buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wouldblock_maps_to_again() {
        let err: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(err.is_again());
    }

    #[test]
    fn test_other_io_maps_to_fatal() {
        let err: NetError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(!err.is_again());
        assert_eq!(
            err,
            NetError::Fatal(Cause::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
        );
    }

    #[test]
    fn test_display_too_large() {
        assert_eq!(
            NetError::Fatal(Cause::TooLarge).to_string(),
            "request too large"
        );
    }
}
