//! File-descriptor transfer over AF_UNIX stream sockets.
//!
//! One descriptor travels per message as SCM_RIGHTS ancillary data. The
//! regular payload carries a single i32 error code: a sender that wants to
//! signal failure alongside the (mandatory) descriptor sets it nonzero, and
//! the receiver closes the descriptor and surfaces the error instead.
//!
//! Ownership transfers with the message: the sender closes its copy after a
//! successful send, the receiver owns what it gets.

use crate::net::support::{Cause, NetError, NetResult};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

// CMSG_SPACE(sizeof(int)) is 24 on 64-bit linux; two cmsghdrs of storage
// keep the buffer aligned and comfortably large on every libc we target.
type CmsgBuf = [libc::cmsghdr; 2];

fn cmsg_space() -> usize {
    unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as libc::c_uint) as usize }
}

/// Send `fd` with an accompanying error code over `sock`.
pub fn send_fd(sock: BorrowedFd<'_>, fd: BorrowedFd<'_>, err: i32) -> NetResult<()> {
    let payload: [u8; 4] = err.to_ne_bytes();
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut _,
        iov_len: payload.len(),
    };
    let mut cmsg_buf: CmsgBuf = unsafe { mem::zeroed() };

    let mut mhdr: libc::msghdr = unsafe { mem::zeroed() };
    mhdr.msg_iov = &mut iov;
    mhdr.msg_iovlen = 1;
    mhdr.msg_control = cmsg_buf.as_mut_ptr().cast();
    mhdr.msg_controllen = cmsg_space() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&mhdr);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd.as_raw_fd());
    }

    loop {
        let ret = unsafe { libc::sendmsg(sock.as_raw_fd(), &mhdr, libc::MSG_NOSIGNAL) };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

/// Receive a descriptor from `sock`. A nonzero error code in the payload
/// closes the received descriptor and surfaces `Cause::Peer`.
pub fn recv_fd(sock: BorrowedFd<'_>) -> NetResult<OwnedFd> {
    let mut payload = [0u8; 4];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    let mut cmsg_buf: CmsgBuf = unsafe { mem::zeroed() };

    let mut mhdr: libc::msghdr = unsafe { mem::zeroed() };
    mhdr.msg_iov = &mut iov;
    mhdr.msg_iovlen = 1;
    mhdr.msg_control = cmsg_buf.as_mut_ptr().cast();
    mhdr.msg_controllen = cmsg_space() as _;

    let nread = loop {
        let ret = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut mhdr, libc::MSG_NOSIGNAL) };
        if ret >= 0 {
            break ret as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    };

    if nread == 0 {
        return Err(NetError::Fatal(Cause::Closed));
    }
    if nread != payload.len() {
        return Err(NetError::Fatal(Cause::Malformed));
    }

    let mut received: Option<OwnedFd> = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&mhdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                && (*cmsg).cmsg_len
                    == libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as usize
            {
                let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                received = Some(OwnedFd::from_raw_fd(raw));
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&mut mhdr, cmsg);
        }
    }

    let fd = received.ok_or(NetError::Fatal(Cause::NoFd))?;

    let code = i32::from_ne_bytes(payload);
    if code != 0 {
        // a valid fd must still travel with the error; drop it here
        drop(fd);
        return Err(NetError::Fatal(Cause::Peer(code)));
    }

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_fd_transfer_roundtrip() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (pipe_r, pipe_w) = nix::unistd::pipe().unwrap();

        send_fd(tx.as_fd(), pipe_w.as_fd(), 0).unwrap();
        drop(pipe_w); // sender's copy; kernel keeps the passed one alive

        let got = recv_fd(rx.as_fd()).unwrap();

        let mut out = std::fs::File::from(got);
        out.write_all(b"through the pipe").unwrap();
        drop(out);

        let mut text = String::new();
        std::fs::File::from(pipe_r).read_to_string(&mut text).unwrap();
        assert_eq!(text, "through the pipe");
    }

    #[test]
    fn test_error_code_closes_fd() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (pipe_r, pipe_w) = nix::unistd::pipe().unwrap();

        send_fd(tx.as_fd(), pipe_w.as_fd(), libc::EPERM).unwrap();
        drop(pipe_w);

        let err = recv_fd(rx.as_fd()).unwrap_err();
        assert_eq!(err, NetError::Fatal(Cause::Peer(libc::EPERM)));

        // both pipe write ends are gone now, so the read end sees EOF
        let mut text = String::new();
        std::fs::File::from(pipe_r).read_to_string(&mut text).unwrap();
        assert!(text.is_empty());
    }

    #[test]
    fn test_recv_would_block() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        assert_eq!(recv_fd(rx.as_fd()).unwrap_err(), NetError::Again);
    }

    #[test]
    fn test_recv_on_closed_peer() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        assert_eq!(
            recv_fd(rx.as_fd()).unwrap_err(),
            NetError::Fatal(Cause::Closed)
        );
    }

    #[test]
    fn test_plain_bytes_are_not_an_fd_message() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(&0i32.to_ne_bytes()).unwrap();
        assert_eq!(
            recv_fd(rx.as_fd()).unwrap_err(),
            NetError::Fatal(Cause::NoFd)
        );
    }
}
