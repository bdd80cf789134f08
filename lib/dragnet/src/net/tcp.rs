//! Outbound TCP connection setup for the scanner.
//!
//! The scanner wants a connected-or-connecting non-blocking socket it can
//! register with its multiplexer; completion (or refusal) shows up as the
//! first readiness event.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};

/// Create a non-blocking TCP socket and initiate a connect to `addr`.
/// Returns the fd with the connect in flight (or already complete);
/// in-progress is success here.
pub fn connect_nonblocking(addr: SocketAddr) -> io::Result<OwnedFd> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(err)
            if err.raw_os_error() == Some(libc::EINPROGRESS)
                || err.kind() == io::ErrorKind::WouldBlock => {}
        Err(err) => return Err(err),
    }

    Ok(socket.into())
}

/// Fetch and clear the socket's pending error, as left behind by an
/// asynchronous connect.
pub fn take_socket_error(fd: &OwnedFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_connect_nonblocking_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let fd = connect_nonblocking(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);
        drop(fd);
    }

    #[test]
    fn test_connect_refused_surfaces_via_so_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener); // port is now closed

        // the connect itself reports in-progress; the refusal lands in
        // SO_ERROR and is visible once the socket signals readiness
        let fd = match connect_nonblocking(addr) {
            Ok(fd) => fd,
            Err(err) => {
                // an immediate refusal is also acceptable
                assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
                return;
            }
        };

        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 2000) };
        assert_eq!(ret, 1);
        assert!(take_socket_error(&fd).is_err());
    }
}
